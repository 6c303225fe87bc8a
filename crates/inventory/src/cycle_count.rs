//! Cycle count aggregate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, ActorId, CycleCountId, DomainError, ItemId, LocationId,
};
use stockledger_events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleCountType {
    Full,
    Partial,
    Abc,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleCountStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountLineStatus {
    Pending,
    Counted,
    /// Variance above threshold; needs a second sign-off.
    Verified,
    /// High variance signed off.
    Approved,
    Adjusted,
}

/// `variance / expected × 100`; an expected quantity of zero counts as 100%
/// (or 0% when nothing was found either).
pub fn variance_pct(expected: i64, counted: i64) -> f64 {
    let variance = counted - expected;
    if expected == 0 {
        if counted == 0 { 0.0 } else { 100.0 }
    } else {
        variance as f64 / expected as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountItem {
    pub item_id: ItemId,
    pub expected_quantity: i64,
    pub counted_quantity: Option<i64>,
    pub variance: i64,
    pub variance_pct: f64,
    pub status: CountLineStatus,
    pub counted_by: Option<ActorId>,
    pub approved_by: Option<ActorId>,
}

/// A variance the ledger must book when the count completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountAdjustment {
    pub item_id: ItemId,
    pub variance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CountWarning {
    /// High-variance line never approved; left unadjusted.
    UnresolvedVariance {
        item_id: ItemId,
        variance: i64,
        variance_pct: f64,
    },
    NotCounted { item_id: ItemId },
    /// Part of a resolved variance the ledger could not book, e.g. a
    /// shortfall of reserved units.
    NotPosted {
        item_id: ItemId,
        quantity: i64,
        reason: String,
    },
}

impl CountWarning {
    pub fn item_id(&self) -> &ItemId {
        match self {
            CountWarning::UnresolvedVariance { item_id, .. }
            | CountWarning::NotCounted { item_id }
            | CountWarning::NotPosted { item_id, .. } => item_id,
        }
    }
}

/// Aggregate root: CycleCount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCount {
    id: CycleCountId,
    number: String,
    location_id: LocationId,
    count_type: CycleCountType,
    variance_threshold: f64,
    lines: Vec<CycleCountItem>,
    assignees: Vec<ActorId>,
    status: CycleCountStatus,
    created_by: Option<ActorId>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl CycleCount {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: CycleCountId) -> Self {
        Self {
            id,
            number: String::new(),
            location_id: LocationId::from(""),
            count_type: CycleCountType::Partial,
            variance_threshold: 0.0,
            lines: Vec::new(),
            assignees: Vec::new(),
            status: CycleCountStatus::Planned,
            created_by: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn location_id(&self) -> &LocationId {
        &self.location_id
    }

    pub fn count_type(&self) -> CycleCountType {
        self.count_type
    }

    pub fn variance_threshold(&self) -> f64 {
        self.variance_threshold
    }

    pub fn lines(&self) -> &[CycleCountItem] {
        &self.lines
    }

    pub fn line(&self, item_id: &ItemId) -> Option<&CycleCountItem> {
        self.lines.iter().find(|l| &l.item_id == item_id)
    }

    pub fn assignees(&self) -> &[ActorId] {
        &self.assignees
    }

    pub fn status(&self) -> CycleCountStatus {
        self.status
    }

    pub fn created_by(&self) -> Option<&ActorId> {
        self.created_by.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl AggregateRoot for CycleCount {
    type Id = CycleCountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateCycleCount. Line selection happens before the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCycleCount {
    pub count_id: CycleCountId,
    pub number: String,
    pub location_id: LocationId,
    pub count_type: CycleCountType,
    pub variance_threshold: f64,
    pub items: Vec<ItemId>,
    pub assignees: Vec<ActorId>,
    pub created_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartCycleCount with the on-hand snapshot per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartCycleCount {
    pub count_id: CycleCountId,
    pub expected: Vec<(ItemId, i64)>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordCount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCount {
    pub count_id: CycleCountId,
    pub item_id: ItemId,
    pub counted_quantity: i64,
    pub counted_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveVariance (secondary sign-off of a verified line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproveVariance {
    pub count_id: CycleCountId,
    pub item_id: ItemId,
    pub approved_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteCycleCount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteCycleCount {
    pub count_id: CycleCountId,
    pub completed_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelCycleCount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelCycleCount {
    pub count_id: CycleCountId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CycleCountCommand {
    Create(CreateCycleCount),
    Start(StartCycleCount),
    RecordCount(RecordCount),
    ApproveVariance(ApproveVariance),
    Complete(CompleteCycleCount),
    Cancel(CancelCycleCount),
}

/// Event: CycleCountCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountCreated {
    pub count_id: CycleCountId,
    pub number: String,
    pub location_id: LocationId,
    pub count_type: CycleCountType,
    pub variance_threshold: f64,
    pub items: Vec<ItemId>,
    pub assignees: Vec<ActorId>,
    pub created_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CycleCountStarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountStarted {
    pub count_id: CycleCountId,
    pub expected: Vec<(ItemId, i64)>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountRecorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRecorded {
    pub count_id: CycleCountId,
    pub item_id: ItemId,
    pub counted_quantity: i64,
    pub variance: i64,
    pub variance_pct: f64,
    pub status: CountLineStatus,
    pub counted_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VarianceApproved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceApproved {
    pub count_id: CycleCountId,
    pub item_id: ItemId,
    pub approved_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CycleCountCompleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountCompleted {
    pub count_id: CycleCountId,
    pub adjustments: Vec<CountAdjustment>,
    pub warnings: Vec<CountWarning>,
    pub completed_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CycleCountCancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountCancelled {
    pub count_id: CycleCountId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CycleCountEvent {
    Created(CycleCountCreated),
    Started(CycleCountStarted),
    CountRecorded(CountRecorded),
    VarianceApproved(VarianceApproved),
    Completed(CycleCountCompleted),
    Cancelled(CycleCountCancelled),
}

impl Event for CycleCountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CycleCountEvent::Created(_) => "inventory.cycle_count.created",
            CycleCountEvent::Started(_) => "inventory.cycle_count.started",
            CycleCountEvent::CountRecorded(_) => "inventory.cycle_count.count_recorded",
            CycleCountEvent::VarianceApproved(_) => "inventory.cycle_count.variance_approved",
            CycleCountEvent::Completed(_) => "inventory.cycle_count.completed",
            CycleCountEvent::Cancelled(_) => "inventory.cycle_count.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CycleCountEvent::Created(e) => e.occurred_at,
            CycleCountEvent::Started(e) => e.occurred_at,
            CycleCountEvent::CountRecorded(e) => e.occurred_at,
            CycleCountEvent::VarianceApproved(e) => e.occurred_at,
            CycleCountEvent::Completed(e) => e.occurred_at,
            CycleCountEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CycleCount {
    type Command = CycleCountCommand;
    type Event = CycleCountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CycleCountEvent::Created(e) => {
                self.id = e.count_id.clone();
                self.number = e.number.clone();
                self.location_id = e.location_id.clone();
                self.count_type = e.count_type;
                self.variance_threshold = e.variance_threshold;
                self.lines = e
                    .items
                    .iter()
                    .map(|item_id| CycleCountItem {
                        item_id: item_id.clone(),
                        expected_quantity: 0,
                        counted_quantity: None,
                        variance: 0,
                        variance_pct: 0.0,
                        status: CountLineStatus::Pending,
                        counted_by: None,
                        approved_by: None,
                    })
                    .collect();
                self.assignees = e.assignees.clone();
                self.status = CycleCountStatus::Planned;
                self.created_by = Some(e.created_by.clone());
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            CycleCountEvent::Started(e) => {
                for (item_id, expected) in &e.expected {
                    if let Some(line) = self.lines.iter_mut().find(|l| &l.item_id == item_id) {
                        line.expected_quantity = *expected;
                    }
                }
                self.status = CycleCountStatus::InProgress;
                self.started_at = Some(e.occurred_at);
            }
            CycleCountEvent::CountRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == e.item_id) {
                    line.counted_quantity = Some(e.counted_quantity);
                    line.variance = e.variance;
                    line.variance_pct = e.variance_pct;
                    line.status = e.status;
                    line.counted_by = Some(e.counted_by.clone());
                    line.approved_by = None;
                }
            }
            CycleCountEvent::VarianceApproved(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == e.item_id) {
                    line.status = CountLineStatus::Approved;
                    line.approved_by = Some(e.approved_by.clone());
                }
            }
            CycleCountEvent::Completed(e) => {
                for adj in &e.adjustments {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == adj.item_id) {
                        line.status = CountLineStatus::Adjusted;
                    }
                }
                self.status = CycleCountStatus::Completed;
                self.completed_at = Some(e.occurred_at);
            }
            CycleCountEvent::Cancelled(_) => {
                self.status = CycleCountStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CycleCountCommand::Create(cmd) => self.handle_create(cmd),
            CycleCountCommand::Start(cmd) => self.handle_start(cmd),
            CycleCountCommand::RecordCount(cmd) => self.handle_record(cmd),
            CycleCountCommand::ApproveVariance(cmd) => self.handle_approve(cmd),
            CycleCountCommand::Complete(cmd) => self.handle_complete(cmd),
            CycleCountCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl CycleCount {
    fn ensure_exists(&self, count_id: &CycleCountId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found("cycle count", count_id));
        }
        if &self.id != count_id {
            return Err(DomainError::validation("count_id mismatch"));
        }
        Ok(())
    }

    fn ensure_status(
        &self,
        allowed: &[CycleCountStatus],
        to: CycleCountStatus,
    ) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("cycle count", self.status, to))
        }
    }

    fn find_line(&self, item_id: &ItemId) -> Result<&CycleCountItem, DomainError> {
        self.line(item_id)
            .ok_or_else(|| DomainError::not_found("cycle count line", item_id))
    }

    fn handle_create(&self, cmd: &CreateCycleCount) -> Result<Vec<CycleCountEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("cycle count already exists"));
        }
        if !cmd.variance_threshold.is_finite() || cmd.variance_threshold < 0.0 {
            return Err(DomainError::validation("variance threshold must be a non-negative percentage"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("a cycle count needs at least one item"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cmd.items.iter().find(|i| !seen.insert(*i)) {
            return Err(DomainError::validation(format!("item {dup} listed more than once")));
        }

        Ok(vec![CycleCountEvent::Created(CycleCountCreated {
            count_id: cmd.count_id.clone(),
            number: cmd.number.clone(),
            location_id: cmd.location_id.clone(),
            count_type: cmd.count_type,
            variance_threshold: cmd.variance_threshold,
            items: cmd.items.clone(),
            assignees: cmd.assignees.clone(),
            created_by: cmd.created_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartCycleCount) -> Result<Vec<CycleCountEvent>, DomainError> {
        self.ensure_exists(&cmd.count_id)?;
        self.ensure_status(&[CycleCountStatus::Planned], CycleCountStatus::InProgress)?;
        for line in &self.lines {
            if !cmd.expected.iter().any(|(id, _)| id == &line.item_id) {
                return Err(DomainError::validation(format!(
                    "no expected quantity snapshot for {}",
                    line.item_id
                )));
            }
        }
        Ok(vec![CycleCountEvent::Started(CycleCountStarted {
            count_id: cmd.count_id.clone(),
            expected: cmd.expected.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record(&self, cmd: &RecordCount) -> Result<Vec<CycleCountEvent>, DomainError> {
        self.ensure_exists(&cmd.count_id)?;
        if self.status != CycleCountStatus::InProgress {
            return Err(DomainError::transition(
                "cycle count",
                self.status,
                CycleCountStatus::InProgress,
            ));
        }
        if cmd.counted_quantity < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        let line = self.find_line(&cmd.item_id)?;

        let variance = cmd.counted_quantity - line.expected_quantity;
        let pct = variance_pct(line.expected_quantity, cmd.counted_quantity);
        let status = if pct.abs() > self.variance_threshold {
            CountLineStatus::Verified
        } else {
            CountLineStatus::Counted
        };

        Ok(vec![CycleCountEvent::CountRecorded(CountRecorded {
            count_id: cmd.count_id.clone(),
            item_id: cmd.item_id.clone(),
            counted_quantity: cmd.counted_quantity,
            variance,
            variance_pct: pct,
            status,
            counted_by: cmd.counted_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveVariance) -> Result<Vec<CycleCountEvent>, DomainError> {
        self.ensure_exists(&cmd.count_id)?;
        if self.status != CycleCountStatus::InProgress {
            return Err(DomainError::transition(
                "cycle count",
                self.status,
                CycleCountStatus::InProgress,
            ));
        }
        let line = self.find_line(&cmd.item_id)?;
        if line.status != CountLineStatus::Verified {
            return Err(DomainError::transition(
                "cycle count line",
                line.status,
                CountLineStatus::Approved,
            ));
        }
        if line.counted_by.as_ref() == Some(&cmd.approved_by) {
            return Err(DomainError::validation(
                "a variance must be approved by someone other than the counter",
            ));
        }
        Ok(vec![CycleCountEvent::VarianceApproved(VarianceApproved {
            count_id: cmd.count_id.clone(),
            item_id: cmd.item_id.clone(),
            approved_by: cmd.approved_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteCycleCount) -> Result<Vec<CycleCountEvent>, DomainError> {
        self.ensure_exists(&cmd.count_id)?;
        self.ensure_status(&[CycleCountStatus::InProgress], CycleCountStatus::Completed)?;

        let mut adjustments = Vec::new();
        let mut warnings = Vec::new();
        for line in &self.lines {
            match line.status {
                CountLineStatus::Counted | CountLineStatus::Approved if line.variance != 0 => {
                    adjustments.push(CountAdjustment {
                        item_id: line.item_id.clone(),
                        variance: line.variance,
                    });
                }
                CountLineStatus::Verified => warnings.push(CountWarning::UnresolvedVariance {
                    item_id: line.item_id.clone(),
                    variance: line.variance,
                    variance_pct: line.variance_pct,
                }),
                CountLineStatus::Pending => warnings.push(CountWarning::NotCounted {
                    item_id: line.item_id.clone(),
                }),
                _ => {}
            }
        }

        Ok(vec![CycleCountEvent::Completed(CycleCountCompleted {
            count_id: cmd.count_id.clone(),
            adjustments,
            warnings,
            completed_by: cmd.completed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelCycleCount) -> Result<Vec<CycleCountEvent>, DomainError> {
        self.ensure_exists(&cmd.count_id)?;
        self.ensure_status(
            &[CycleCountStatus::Planned, CycleCountStatus::InProgress],
            CycleCountStatus::Cancelled,
        )?;
        Ok(vec![CycleCountEvent::Cancelled(CycleCountCancelled {
            count_id: cmd.count_id.clone(),
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
