use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::StationId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StationError {
    #[error("unknown station {0}")]
    UnknownStation(StationId),
    #[error("no free slot at station {0}")]
    NoFreeSlot(StationId),
    #[error("station service unavailable: {0}")]
    Unavailable(String),
}

/// Parking-slot inventory owned by the station service. Reservations only
/// ever ask for, take, and give back a single slot.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    async fn has_available_slot(&self, station: StationId) -> Result<bool, StationError>;
    async fn reserve(&self, station: StationId) -> Result<(), StationError>;
    async fn release(&self, station: StationId) -> Result<(), StationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slots {
    total: u32,
    reserved: u32,
}

/// Slot counts kept in process. Used when stations are managed alongside the
/// engine, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryStations {
    slots: DashMap<StationId, Slots>,
}

impl InMemoryStations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_station(&self, id: StationId, total: u32) {
        self.slots.insert(id, Slots { total, reserved: 0 });
    }

    pub fn available(&self, id: &StationId) -> Option<u32> {
        self.slots.get(id).map(|s| s.total - s.reserved)
    }
}

#[async_trait]
impl StationDirectory for InMemoryStations {
    async fn has_available_slot(&self, station: StationId) -> Result<bool, StationError> {
        self.available(&station)
            .map(|free| free > 0)
            .ok_or(StationError::UnknownStation(station))
    }

    async fn reserve(&self, station: StationId) -> Result<(), StationError> {
        let mut slots = self
            .slots
            .get_mut(&station)
            .ok_or(StationError::UnknownStation(station))?;
        if slots.reserved >= slots.total {
            return Err(StationError::NoFreeSlot(station));
        }
        slots.reserved += 1;
        Ok(())
    }

    async fn release(&self, station: StationId) -> Result<(), StationError> {
        let mut slots = self
            .slots
            .get_mut(&station)
            .ok_or(StationError::UnknownStation(station))?;
        slots.reserved = slots.reserved.saturating_sub(1);
        Ok(())
    }
}
