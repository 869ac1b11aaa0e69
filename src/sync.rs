use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;

use crate::config::NoteSettings;
use crate::error::PersistenceError;
use crate::model::{GroupId, InternalPayload, Mask, RecordFields, RecordRef};

/// Record storage. Implementations are driven by a single writer at a time.
pub trait PersistenceGateway {
    fn find_by_group(&mut self, group: &GroupId) -> impl Future<Output = Result<Vec<RecordRef>, PersistenceError>> + Send;
    fn read(&mut self, record: RecordRef) -> impl Future<Output = Result<RecordFields, PersistenceError>> + Send;
    fn create(&mut self, group: &GroupId) -> impl Future<Output = Result<RecordRef, PersistenceError>> + Send;
    fn write(
        &mut self,
        record: RecordRef,
        fields: &RecordFields,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
    fn delete(&mut self, records: &[RecordRef]) -> impl Future<Output = Result<(), PersistenceError>> + Send;
    fn commit(&mut self) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// Asks the user before anything destructive happens.
pub trait Notifier {
    fn confirm(&self, message: &str) -> bool;
}

/// A notifier whose answer was collected up front, e.g. from a request body.
#[derive(Debug, Clone, Copy)]
pub struct PresetNotifier(pub bool);

impl Notifier for PresetNotifier {
    fn confirm(&self, message: &str) -> bool {
        tracing::info!(answer = self.0, "{}", message.replace('\n', " "));
        self.0
    }
}

pub enum SyncResult<T> {
    Created(T),
    Updated(T),
    Unchanged(T),
    Error(RecordFailure),
}

impl SyncResult<RecordRef> {
    pub fn record(self, report: &mut SyncReport) -> Option<RecordRef> {
        match self {
            SyncResult::Created(r) => {
                report.stats.created += 1;
                Some(r)
            }
            SyncResult::Updated(r) => {
                report.stats.updated += 1;
                Some(r)
            }
            SyncResult::Unchanged(r) => {
                report.stats.unchanged += 1;
                Some(r)
            }
            SyncResult::Error(failure) => {
                report.failures.push(failure);
                None
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub retained: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Create,
    Update,
    Delete,
    Commit,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub op: SyncOp,
    /// 1-based stored index the failure concerns, when there is one.
    pub no: Option<usize>,
    pub record: Option<RecordRef>,
    pub error: String,
}

impl RecordFailure {
    fn new(op: SyncOp, no: Option<usize>, record: Option<RecordRef>, err: &PersistenceError) -> Self {
        RecordFailure {
            op,
            no,
            record,
            error: crate::unpack_error(err),
        }
    }
}

/// What happened to records beyond the end of the mask list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtrasOutcome {
    None,
    Deleted { count: usize },
    Retained { count: usize },
    DeleteFailed { count: usize, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub group: GroupId,
    pub stats: SyncStats,
    /// Record at each mask position, `None` where create/update failed or a
    /// created record was rolled back.
    pub records: Vec<Option<RecordRef>>,
    pub extras: ExtrasOutcome,
    pub failures: Vec<RecordFailure>,
}

impl SyncReport {
    fn new(group: GroupId) -> Self {
        SyncReport {
            group,
            stats: SyncStats::default(),
            records: Vec::new(),
            extras: ExtrasOutcome::None,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Forgets creates and updates that a failed commit rolled back.
    fn discard_uncommitted(&mut self, created: &[usize]) {
        self.stats.created = 0;
        self.stats.updated = 0;
        for &position in created {
            self.records[position] = None;
        }
    }

    /// Count of persisted content changes made by this pass.
    pub fn mutations(&self) -> usize {
        self.stats.created + self.stats.updated + self.stats.deleted
    }
}

/// The desired state of one group.
#[derive(Debug, Clone, Copy)]
pub struct SyncTarget<'a> {
    pub group: &'a GroupId,
    pub image: &'a str,
    pub masks: &'a [Mask],
    pub title: &'a str,
    pub explanation: &'a str,
}

struct Existing {
    record: RecordRef,
    fields: RecordFields,
}

/// Matches an ordered mask list onto the records of a group by position.
pub struct GroupSynchronizer<'a> {
    notes: &'a NoteSettings,
}

impl<'a> GroupSynchronizer<'a> {
    pub fn new(notes: &'a NoteSettings) -> Self {
        GroupSynchronizer { notes }
    }

    /// Builds the fields of the record at 0-based `position`.
    pub fn target_fields(&self, target: &SyncTarget<'_>, position: usize) -> RecordFields {
        let mask = &target.masks[position];
        let no = position + 1;
        let title_primary = if target.title.is_empty() { target.image } else { target.title };

        RecordFields {
            group_id: target.group.as_str().to_string(),
            no: no.to_string(),
            image_file: target.image.to_string(),
            image_html: format!(r#"<img class="{}" src="{}">"#, self.notes.image_class, target.image),
            sort_key: format!("{} #{:03}", title_primary, no),
            title: target.title.to_string(),
            explanation: target.explanation.to_string(),
            mask_label: mask.label.clone(),
            internal: InternalPayload::new(target.image, target.group, position, target.masks, &mask.label).pack(),
        }
    }

    /// Runs one synchronization pass. Only a failure to list or read the
    /// group's current records aborts the pass; everything else is reported
    /// per record in the returned report.
    pub async fn sync<G, N>(
        &self,
        gateway: &mut G,
        notifier: &N,
        target: &SyncTarget<'_>,
    ) -> Result<SyncReport, PersistenceError>
    where
        G: PersistenceGateway,
        N: Notifier,
    {
        let mut report = SyncReport::new(target.group.clone());
        let (mut by_index, duplicates) = self.load_group(gateway, target.group).await?;

        tracing::info!(
            group = %target.group,
            masks = target.masks.len(),
            existing = by_index.len() + duplicates.len(),
            "syncing group"
        );

        let mut created = Vec::new();
        for position in 0..target.masks.len() {
            let fields = self.target_fields(target, position);
            let result = match by_index.remove(&position) {
                Some(existing) => update_record(gateway, existing, &fields).await,
                None => create_record(gateway, target.group, &fields).await,
            };
            if matches!(result, SyncResult::Created(_)) {
                created.push(position);
            }
            let record = result.record(&mut report);
            report.records.push(record);
        }

        if let Err(e) = gateway.commit().await {
            tracing::error!(group = %target.group, error = %e, "failed to commit group records, extras left alone");
            report.failures.push(RecordFailure::new(SyncOp::Commit, None, None, &e));
            report.discard_uncommitted(&created);
            return Ok(report);
        }

        // whatever is left in the map sits at or past the end of the list
        let mut extras: Vec<RecordRef> = by_index.into_values().map(|e| e.record).collect();
        extras.extend(duplicates);
        extras.sort();

        if !extras.is_empty() {
            report.extras = remove_extras(gateway, notifier, &extras, target.masks.len(), &mut report).await;
        }

        tracing::info!(
            group = %target.group,
            created = report.stats.created,
            updated = report.stats.updated,
            unchanged = report.stats.unchanged,
            deleted = report.stats.deleted,
            retained = report.stats.retained,
            failures = report.failures.len(),
            "group synced"
        );
        Ok(report)
    }

    /// Maps stored index to record. Records with an unusable index are left
    /// out; later records claiming a taken index are returned as duplicates.
    async fn load_group<G: PersistenceGateway>(
        &self,
        gateway: &mut G,
        group: &GroupId,
    ) -> Result<(BTreeMap<usize, Existing>, Vec<RecordRef>), PersistenceError> {
        let mut refs = gateway.find_by_group(group).await?;
        refs.sort();

        let mut by_index = BTreeMap::new();
        let mut duplicates = Vec::new();
        for record in refs {
            let fields = gateway.read(record).await?;
            let Some(position) = fields.position() else {
                tracing::warn!(group = %group, %record, no = %fields.no, "ignoring record with malformed index");
                continue;
            };
            if by_index.contains_key(&position) {
                tracing::warn!(group = %group, %record, no = position + 1, "duplicate record at index");
                duplicates.push(record);
                continue;
            }
            by_index.insert(position, Existing { record, fields });
        }
        Ok((by_index, duplicates))
    }
}

fn is_unchanged(existing: &RecordFields, target: &RecordFields) -> bool {
    existing.content_hash() == target.content_hash()
}

async fn update_record<G: PersistenceGateway>(
    gateway: &mut G,
    existing: Existing,
    fields: &RecordFields,
) -> SyncResult<RecordRef> {
    if is_unchanged(&existing.fields, fields) {
        tracing::debug!(record = %existing.record, no = %fields.no, "record unchanged");
        return SyncResult::Unchanged(existing.record);
    }

    match gateway.write(existing.record, fields).await {
        Ok(()) => {
            tracing::debug!(record = %existing.record, no = %fields.no, "record updated");
            SyncResult::Updated(existing.record)
        }
        Err(e) => {
            tracing::error!("Failed to update {} at index {}: {}", existing.record, fields.no, e);
            SyncResult::Error(RecordFailure::new(
                SyncOp::Update,
                fields.position().map(|p| p + 1),
                Some(existing.record),
                &e,
            ))
        }
    }
}

async fn create_record<G: PersistenceGateway>(
    gateway: &mut G,
    group: &GroupId,
    fields: &RecordFields,
) -> SyncResult<RecordRef> {
    let no = fields.position().map(|p| p + 1);
    let record = match gateway.create(group).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to create record {} in group {}: {}", fields.no, group, e);
            return SyncResult::Error(RecordFailure::new(SyncOp::Create, no, None, &e));
        }
    };

    if let Err(e) = gateway.write(record, fields).await {
        tracing::error!("Failed to write new {} at index {}: {}", record, fields.no, e);
        // an index-less record would linger in the group unmatched
        if let Err(cleanup) = gateway.delete(&[record]).await {
            tracing::warn!("Failed to discard half-created {}: {}", record, cleanup);
        }
        return SyncResult::Error(RecordFailure::new(SyncOp::Create, no, Some(record), &e));
    }

    tracing::debug!(%record, no = %fields.no, "record created");
    SyncResult::Created(record)
}

async fn remove_extras<G, N>(
    gateway: &mut G,
    notifier: &N,
    extras: &[RecordRef],
    len: usize,
    report: &mut SyncReport,
) -> ExtrasOutcome
where
    G: PersistenceGateway,
    N: Notifier,
{
    let count = extras.len();
    let message = format!(
        "This group has {} extra record(s).\n(index >= {})\n\nDelete them?",
        count, len
    );
    if !notifier.confirm(&message) {
        tracing::info!(group = %report.group, count, "extra records retained");
        report.stats.retained += count;
        return ExtrasOutcome::Retained { count };
    }

    let result = match gateway.delete(extras).await {
        Ok(()) => gateway.commit().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::info!(group = %report.group, count, "extra records deleted");
            report.stats.deleted += count;
            ExtrasOutcome::Deleted { count }
        }
        Err(e) => {
            tracing::error!(group = %report.group, error = %e, "failed to delete extra records");
            for record in extras {
                report
                    .failures
                    .push(RecordFailure::new(SyncOp::Delete, None, Some(*record), &e));
            }
            ExtrasOutcome::DeleteFailed {
                count,
                error: crate::unpack_error(&e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{CountingNotifier, MemoryGateway};
    use super::*;
    use crate::model::MaskSource;

    fn masks(n: usize) -> Vec<Mask> {
        (0..n)
            .map(|i| Mask {
                x: 0.1 * i as f64,
                y: 0.0,
                w: 0.05,
                h: 0.05,
                label: format!("label {}", i),
                source: MaskSource::User,
            })
            .collect()
    }

    fn target<'a>(group: &'a GroupId, masks: &'a [Mask]) -> SyncTarget<'a> {
        SyncTarget {
            group,
            image: "diagram.png",
            masks,
            title: "Heart",
            explanation: "Chambers",
        }
    }

    #[tokio::test]
    async fn creates_every_record_for_a_new_group() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let group = GroupId::new("g1");
        let list = masks(3);

        let report = sync.sync(&mut gw, &CountingNotifier::new(false), &target(&group, &list)).await.unwrap();

        assert_eq!(report.stats.created, 3);
        assert_eq!(gw.group_size("g1"), 3);
        let first = gw.records.values().find(|f| f.no == "1").unwrap();
        assert_eq!(first.sort_key, "Heart #001");
        assert_eq!(first.image_html, r#"<img class="aioe-img" src="diagram.png">"#);
        assert_eq!(first.mask_label, "label 0");
        let payload = first.payload().unwrap();
        assert_eq!(payload.active, 0);
        assert_eq!(payload.masks, list);
        assert_eq!(payload.group, "g1");
    }

    #[tokio::test]
    async fn sort_key_falls_back_to_image_name() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let group = GroupId::new("g");
        let list = masks(12);
        let mut t = target(&group, &list);
        t.title = "";
        assert_eq!(sync.target_fields(&t, 11).sort_key, "diagram.png #012");
    }

    #[tokio::test]
    async fn second_identical_sync_mutates_nothing() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let group = GroupId::new("g1");
        let list = masks(4);
        let notifier = CountingNotifier::new(true);

        sync.sync(&mut gw, &notifier, &target(&group, &list)).await.unwrap();
        gw.reset_counters();
        let report = sync.sync(&mut gw, &notifier, &target(&group, &list)).await.unwrap();

        assert_eq!(report.mutations(), 0);
        assert_eq!(report.stats.unchanged, 4);
        assert_eq!((gw.creates, gw.writes, gw.deletes), (0, 0, 0));
        assert_eq!(notifier.asked.get(), 0);
    }

    #[tokio::test]
    async fn extras_are_retained_when_declined() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let a = gw.seed("g1", "1");
        let b = gw.seed("g1", "2");
        let c = gw.seed("g1", "3");
        let group = GroupId::new("g1");
        let list = masks(2);
        let notifier = CountingNotifier::new(false);

        let report = sync.sync(&mut gw, &notifier, &target(&group, &list)).await.unwrap();

        assert_eq!(notifier.asked.get(), 1);
        assert_eq!(report.extras, ExtrasOutcome::Retained { count: 1 });
        assert_eq!(report.stats.retained, 1);
        assert_eq!(report.records, vec![Some(a), Some(b)]);
        assert!(gw.records.contains_key(&c.0));
        assert_eq!(gw.records[&c.0].no, "3");
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn extras_are_deleted_when_confirmed() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        gw.seed("g1", "1");
        gw.seed("g1", "2");
        let c = gw.seed("g1", "3");
        let group = GroupId::new("g1");
        let list = masks(2);

        let report = sync.sync(&mut gw, &CountingNotifier::new(true), &target(&group, &list)).await.unwrap();

        assert_eq!(report.extras, ExtrasOutcome::Deleted { count: 1 });
        assert_eq!(report.stats.deleted, 1);
        assert!(!gw.records.contains_key(&c.0));
        assert_eq!(gw.group_size("g1"), 2);
    }

    #[tokio::test]
    async fn growing_a_group_keeps_the_existing_record() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let a = gw.seed("g1", "1");
        let group = GroupId::new("g1");
        let list = masks(3);

        let report = sync.sync(&mut gw, &CountingNotifier::new(false), &target(&group, &list)).await.unwrap();

        assert_eq!(report.records[0], Some(a));
        assert_eq!(report.stats.updated, 1);
        assert_eq!(report.stats.created, 2);
        assert_eq!(gw.creates, 2);
        assert_eq!(gw.group_size("g1"), 3);
        let mut nos: Vec<String> = gw.records.values().map(|f| f.no.clone()).collect();
        nos.sort();
        assert_eq!(nos, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn malformed_indices_are_left_alone() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let junk = gw.seed("g1", "n/a");
        let zero = gw.seed("g1", "0");
        let notifier = CountingNotifier::new(true);
        let group = GroupId::new("g1");
        let list = masks(1);

        let report = sync.sync(&mut gw, &notifier, &target(&group, &list)).await.unwrap();

        assert_eq!(report.stats.created, 1);
        assert_eq!(notifier.asked.get(), 0);
        assert_eq!(gw.records[&junk.0].no, "n/a");
        assert_eq!(gw.records[&zero.0].no, "0");
    }

    #[tokio::test]
    async fn duplicate_indices_collapse_to_the_oldest_record() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let first = gw.seed("g1", "1");
        let dup = gw.seed("g1", "1");
        let group = GroupId::new("g1");
        let list = masks(1);

        let report = sync.sync(&mut gw, &CountingNotifier::new(true), &target(&group, &list)).await.unwrap();

        assert_eq!(report.records, vec![Some(first)]);
        assert_eq!(report.extras, ExtrasOutcome::Deleted { count: 1 });
        assert!(!gw.records.contains_key(&dup.0));
    }

    #[tokio::test]
    async fn a_failed_write_does_not_stop_later_indices() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        gw.fail_writes_for_no.insert("2".to_string());
        let group = GroupId::new("g1");
        let list = masks(3);

        let report = sync.sync(&mut gw, &CountingNotifier::new(false), &target(&group, &list)).await.unwrap();

        assert_eq!(report.stats.created, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].op, SyncOp::Create);
        assert_eq!(report.failures[0].no, Some(2));
        assert!(report.records[1].is_none());
        // the half-created record is discarded rather than left index-less
        assert_eq!(gw.group_size("g1"), 2);
    }

    #[tokio::test]
    async fn delete_failure_keeps_applied_updates() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let a = gw.seed("g1", "1");
        gw.seed("g1", "2");
        gw.fail_delete = true;
        let group = GroupId::new("g1");
        let list = masks(1);

        let report = sync.sync(&mut gw, &CountingNotifier::new(true), &target(&group, &list)).await.unwrap();

        assert!(matches!(report.extras, ExtrasOutcome::DeleteFailed { count: 1, .. }));
        assert_eq!(report.failures[0].op, SyncOp::Delete);
        assert_eq!(gw.records[&a.0].mask_label, "label 0");
        assert_eq!(gw.group_size("g1"), 2);
    }

    #[tokio::test]
    async fn failed_commit_reports_nothing_created_and_skips_extras() {
        let notes = NoteSettings::default();
        let sync = GroupSynchronizer::new(&notes);
        let mut gw = MemoryGateway::default();
        let a = gw.seed("g1", "1");
        gw.seed("g1", "5");
        gw.fail_commit = true;
        let group = GroupId::new("g1");
        let list = masks(3);
        let notifier = CountingNotifier::new(true);

        let report = sync.sync(&mut gw, &notifier, &target(&group, &list)).await.unwrap();

        assert_eq!((report.stats.created, report.stats.updated), (0, 0));
        assert_eq!(report.records, vec![Some(a), None, None]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].op, SyncOp::Commit);
        assert_eq!(report.extras, ExtrasOutcome::None);
        assert_eq!(notifier.asked.get(), 0);
        assert_eq!(gw.deletes, 0);
    }
}
