//! Serial-number tracking (one record per physical unit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId, LocationId, MovementId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialStatus {
    Available,
    Reserved,
    Sold,
    Damaged,
    Returned,
    /// Left the books through a write-off or a count shortfall. Terminal.
    #[serde(rename = "written_off")]
    WrittenOff,
}

impl SerialStatus {
    pub fn can_transition_to(self, next: SerialStatus) -> bool {
        use SerialStatus::*;
        matches!(
            (self, next),
            (Available, Reserved)
                | (Available, Damaged)
                | (Reserved, Sold)
                | (Reserved, Damaged)
                | (Reserved, Available)
                | (Sold, Returned)
                | (Sold, Damaged)
                | (Returned, Available)
                | (Returned, Damaged)
                | (Available, WrittenOff)
                | (Returned, WrittenOff)
                | (Damaged, WrittenOff)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialTransition {
    pub from: SerialStatus,
    pub to: SerialStatus,
    pub movement_id: Option<MovementId>,
    pub at: DateTime<Utc>,
}

/// A uniquely identified unit of a serial-tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialNumber {
    pub item_id: ItemId,
    pub serial: String,
    pub location_id: LocationId,
    pub status: SerialStatus,
    pub lot_number: Option<String>,
    pub received_at: DateTime<Utc>,
    pub history: Vec<SerialTransition>,
}

impl SerialNumber {
    /// A unit entering stock for the first time.
    pub fn receive(
        item_id: ItemId,
        serial: impl Into<String>,
        location_id: LocationId,
        received_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let serial = serial.into();
        if serial.trim().is_empty() {
            return Err(DomainError::validation("serial number cannot be empty"));
        }
        Ok(Self {
            item_id,
            serial,
            location_id,
            status: SerialStatus::Available,
            lot_number: None,
            received_at,
            history: Vec::new(),
        })
    }

    /// Validate and perform a state change; illegal transitions mutate nothing.
    pub fn transition(
        &mut self,
        next: SerialStatus,
        movement_id: Option<&MovementId>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::transition("serial", self.status, next));
        }
        self.history.push(SerialTransition {
            from: self.status,
            to: next,
            movement_id: movement_id.cloned(),
            at,
        });
        self.status = next;
        Ok(())
    }

    pub fn relocate(&mut self, location_id: LocationId) {
        self.location_id = location_id;
    }

    pub fn last_movement(&self) -> Option<&MovementId> {
        self.history.last().and_then(|t| t.movement_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> SerialNumber {
        SerialNumber::receive(
            ItemId::from("phone"),
            "SN-001",
            LocationId::from("wh-1"),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn happy_path_pick_then_sell() {
        let mut s = unit();
        let mv = MovementId::from("mv-1");
        s.transition(SerialStatus::Reserved, Some(&mv), Utc::now()).unwrap();
        s.transition(SerialStatus::Sold, Some(&mv), Utc::now()).unwrap();
        assert_eq!(s.status, SerialStatus::Sold);
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.last_movement(), Some(&mv));
    }

    #[test]
    fn sold_serial_cannot_be_reserved_again() {
        let mut s = unit();
        s.transition(SerialStatus::Reserved, None, Utc::now()).unwrap();
        s.transition(SerialStatus::Sold, None, Utc::now()).unwrap();
        let before = s.clone();
        let err = s
            .transition(SerialStatus::Reserved, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(s, before);
    }

    #[test]
    fn sold_serial_only_goes_to_returned_or_damaged() {
        use SerialStatus::*;
        let legal: Vec<_> = [Available, Reserved, Sold, Damaged, Returned, WrittenOff]
            .into_iter()
            .filter(|next| Sold.can_transition_to(*next))
            .collect();
        assert_eq!(legal, vec![Damaged, Returned]);
    }

    #[test]
    fn written_off_is_terminal() {
        use SerialStatus::*;
        let mut s = unit();
        s.transition(Damaged, None, Utc::now()).unwrap();
        s.transition(WrittenOff, None, Utc::now()).unwrap();
        for next in [Available, Reserved, Sold, Damaged, Returned] {
            assert!(!WrittenOff.can_transition_to(next));
        }
        assert!(!Sold.can_transition_to(WrittenOff));
        assert_eq!(serde_json::to_value(WrittenOff).unwrap(), "written_off");
    }

    #[test]
    fn available_cannot_be_sold_without_pick() {
        let mut s = unit();
        assert!(s.transition(SerialStatus::Sold, None, Utc::now()).is_err());
    }

    #[test]
    fn blank_serial_is_rejected() {
        assert!(
            SerialNumber::receive(ItemId::from("x"), " ", LocationId::from("l"), Utc::now())
                .is_err()
        );
    }
}
