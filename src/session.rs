//! One editing session over one image.
//!
//! A session is owned by whoever drives the editor; there is no shared
//! instance. It keeps the working mask list, collects suggestion results
//! and exports through the group synchronizer.

use serde::Serialize;

use crate::config::NoteSettings;
use crate::error::{ExportError, PersistenceError, ProviderError};
use crate::model::{ExportPayload, GroupId, MaskList, Meta, RecordFields, RecordRef};
use crate::sync::{GroupSynchronizer, Notifier, PersistenceGateway, SyncReport, SyncTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Create,
    Edit,
}

/// Handed out when a suggestion request starts; only the newest ticket of an
/// open session can deliver results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuggestionTicket {
    generation: u64,
}

#[derive(Debug)]
pub enum SuggestOutcome {
    Applied(usize),
    Discarded,
    Failed(ProviderError),
}

/// Like [`SuggestionTicket`], for title/explanation generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaTicket {
    generation: u64,
}

#[derive(Debug)]
pub enum MetaOutcome {
    Applied,
    Discarded,
    Failed(ProviderError),
}

#[derive(Debug, Clone, Serialize)]
pub struct EditSession {
    pub mode: SessionMode,
    pub group: Option<GroupId>,
    pub image: String,
    pub masks: MaskList,
    /// Latest sanitized suggestions awaiting review in the editor.
    pub suggestions: MaskList,
    pub title: String,
    pub explanation: String,
    #[serde(skip)]
    closed: bool,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    meta_generation: u64,
}

impl EditSession {
    pub fn open_create() -> Self {
        EditSession {
            mode: SessionMode::Create,
            group: None,
            image: String::new(),
            masks: Vec::new(),
            suggestions: Vec::new(),
            title: String::new(),
            explanation: String::new(),
            closed: false,
            generation: 0,
            meta_generation: 0,
        }
    }

    /// Reopens an exported group from the snapshot stored on its records.
    /// The lowest-indexed record with a readable snapshot wins; records
    /// without one fall back to their plain fields.
    pub async fn open_edit<G: PersistenceGateway>(gateway: &mut G, group: &GroupId) -> Result<Self, PersistenceError> {
        let refs = gateway.find_by_group(group).await?;
        let mut records: Vec<(Option<usize>, RecordRef, RecordFields)> = Vec::with_capacity(refs.len());
        for record in refs {
            let fields = gateway.read(record).await?;
            records.push((fields.position(), record, fields));
        }
        // valid positions first (None sorts before Some, so flip it)
        records.sort_by_key(|(position, record, _)| (position.is_none(), *position, *record));

        let Some((_, _, first)) = records.first() else {
            return Err(PersistenceError::GroupNotFound(group.clone()));
        };

        let mut session = EditSession::open_create();
        session.mode = SessionMode::Edit;
        session.group = Some(group.clone());
        session.title = first.title.clone();
        session.explanation = first.explanation.clone();

        match records.iter().find_map(|(_, _, fields)| fields.payload()) {
            Some(payload) => {
                session.image = if payload.image.is_empty() { first.image_file.clone() } else { payload.image };
                session.masks = payload.masks;
            }
            None => {
                tracing::warn!(group = %group, "no record carries a readable snapshot, masks not recovered");
                session.image = first.image_file.clone();
            }
        }

        tracing::info!(group = %group, image = %session.image, masks = session.masks.len(), "opened group for editing");
        Ok(session)
    }

    /// Switching images starts over: masks, group and metadata are dropped,
    /// and results still pending for the old image will be discarded.
    pub fn set_image(&mut self, image: &str) {
        self.generation += 1;
        self.meta_generation += 1;
        self.mode = SessionMode::Create;
        self.group = None;
        self.image = image.to_string();
        self.masks.clear();
        self.suggestions.clear();
        self.title.clear();
        self.explanation.clear();
    }

    pub fn apply_export(&mut self, payload: &ExportPayload, label_max_chars: usize) -> Result<(), ExportError> {
        self.masks = payload.mask_list(label_max_chars)?;
        if let Some(meta) = &payload.meta {
            self.title = meta.title.clone();
            self.explanation = meta.explanation.clone();
        }
        Ok(())
    }

    pub fn begin_suggestion(&mut self) -> SuggestionTicket {
        self.generation += 1;
        SuggestionTicket {
            generation: self.generation,
        }
    }

    /// Delivers a suggestion result. Results for a closed session or a
    /// superseded ticket are dropped.
    pub fn finish_suggestion(
        &mut self,
        ticket: SuggestionTicket,
        result: Result<MaskList, ProviderError>,
    ) -> SuggestOutcome {
        if self.closed || ticket.generation != self.generation {
            tracing::debug!(closed = self.closed, "discarding late suggestion result");
            return SuggestOutcome::Discarded;
        }
        match result {
            Ok(masks) => {
                let n = masks.len();
                self.suggestions = masks;
                SuggestOutcome::Applied(n)
            }
            Err(e) => {
                tracing::warn!(error = %e, "mask suggestion failed");
                SuggestOutcome::Failed(e)
            }
        }
    }

    pub fn begin_meta(&mut self) -> MetaTicket {
        self.meta_generation += 1;
        MetaTicket {
            generation: self.meta_generation,
        }
    }

    /// Fills title and explanation from a generated description, under the
    /// same rules as [`EditSession::finish_suggestion`].
    pub fn finish_meta(&mut self, ticket: MetaTicket, result: Result<Meta, ProviderError>) -> MetaOutcome {
        if self.closed || ticket.generation != self.meta_generation {
            tracing::debug!(closed = self.closed, "discarding late metadata result");
            return MetaOutcome::Discarded;
        }
        match result {
            Ok(meta) => {
                self.title = meta.title;
                self.explanation = meta.explanation;
                MetaOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(error = %e, "metadata generation failed");
                MetaOutcome::Failed(e)
            }
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Writes the session to storage. A create-mode session gets a fresh
    /// group and is cleared afterwards.
    pub async fn export<G, N>(
        &mut self,
        gateway: &mut G,
        notifier: &N,
        notes: &NoteSettings,
    ) -> Result<SyncReport, ExportError>
    where
        G: PersistenceGateway,
        N: Notifier,
    {
        if self.image.is_empty() {
            return Err(ExportError::NoImage);
        }
        if self.masks.is_empty() {
            return Err(ExportError::NoMasks);
        }

        let group = match self.mode {
            SessionMode::Create => GroupId::generate(),
            SessionMode::Edit => match &self.group {
                Some(g) if !g.is_empty() => g.clone(),
                _ => return Err(ExportError::MissingGroup),
            },
        };

        let target = SyncTarget {
            group: &group,
            image: &self.image,
            masks: &self.masks,
            title: &self.title,
            explanation: &self.explanation,
        };
        let report = GroupSynchronizer::new(notes).sync(gateway, notifier, &target).await?;

        if self.mode == SessionMode::Create {
            tracing::info!(group = %group, created = report.stats.created, "created group");
            self.image.clear();
            self.masks.clear();
            self.suggestions.clear();
            self.title.clear();
            self.explanation.clear();
            self.group = None;
        }
        Ok(report)
    }
}
