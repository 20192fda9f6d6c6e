use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::ScheduleError,
    storage::{transaction, PersistentStore},
};

pub const MAX_SCHEDULES: usize = 10;

/// Bytes used by the placement counter at the start of the region.
pub const COUNT_SIZE: usize = 4;
/// Bytes used by one slot record.
pub const SLOT_SIZE: usize = 8;

pub type SlotIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "startHour")]
    pub start_hour: u8,
    #[serde(rename = "startMinute")]
    pub start_minute: u8,
    #[serde(rename = "durationSecs")]
    pub duration_secs: u32,
    #[serde(skip)]
    pub active: bool,
}

impl Schedule {
    /// Builds an inactive schedule, rejecting out-of-range wall-clock fields.
    pub fn new(
        start_hour: u8,
        start_minute: u8,
        duration_secs: u32,
    ) -> Result<Self, ScheduleError> {
        if start_hour > 23 {
            return Err(ScheduleError::InvalidSchedule("start hour must be 0-23"));
        }
        if start_minute > 59 {
            return Err(ScheduleError::InvalidSchedule("start minute must be 0-59"));
        }
        Ok(Self {
            start_hour,
            start_minute,
            duration_secs,
            active: false,
        })
    }

    pub fn window_start_secs(&self) -> u32 {
        self.start_hour as u32 * 3600 + self.start_minute as u32 * 60
    }

    /// End of the window, not wrapped at midnight.
    pub fn window_end_secs(&self) -> u64 {
        self.window_start_secs() as u64 + self.duration_secs as u64
    }

    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut record = [0_u8; SLOT_SIZE];
        record[0] = self.start_hour;
        record[1] = self.start_minute;
        record[2] = u8::from(self.active);
        record[4..8].copy_from_slice(&self.duration_secs.to_le_bytes());
        record
    }

    fn decode(record: &[u8; SLOT_SIZE]) -> Option<Self> {
        let active = match record[2] {
            0 => false,
            1 => true,
            _ => return None,
        };
        let duration_secs = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        let mut schedule = Self::new(record[0], record[1], duration_secs).ok()?;
        schedule.active = active;
        Some(schedule)
    }
}

/// Fixed-capacity schedule table with stable slot indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStore {
    slots: [Schedule; MAX_SCHEDULES],
    count: u32,
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self {
            slots: [Schedule::default(); MAX_SCHEDULES],
            count: 0,
        }
    }
}

impl ScheduleStore {
    /// Reads the table back from the region. Corrupt content is repaired, never rejected.
    pub fn load<S: PersistentStore + ?Sized>(store: &mut S) -> Self {
        let mut loaded = Self::default();

        let mut header = [0_u8; COUNT_SIZE];
        if let Err(err) = store.read(0, &mut header) {
            warn!("failed to read schedule header, starting empty: {err}");
            return loaded;
        }
        let count = u32::from_le_bytes(header);
        loaded.count = if count as usize > MAX_SCHEDULES {
            warn!("persisted schedule count {count} exceeds capacity, clamping to {MAX_SCHEDULES}");
            MAX_SCHEDULES as u32
        } else {
            count
        };

        for (index, slot) in loaded.slots.iter_mut().enumerate() {
            let mut record = [0_u8; SLOT_SIZE];
            if let Err(err) = store.read(slot_offset(index), &mut record) {
                warn!("failed to read schedule slot {index}: {err}");
                continue;
            }
            match Schedule::decode(&record) {
                Some(schedule) => *slot = schedule,
                None => warn!("schedule slot {index} is corrupt, resetting to free"),
            }
        }

        info!(
            "loaded {} active schedules (count {})",
            loaded.active_count(),
            loaded.count
        );
        loaded
    }

    /// Rewrites the counter and every slot, inactive ones included, as one transaction.
    pub fn persist<S: PersistentStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<(), ScheduleError> {
        transaction(store, |store| {
            store.write(0, &self.count.to_le_bytes())?;
            for (index, slot) in self.slots.iter().enumerate() {
                store.write(slot_offset(index), &slot.encode())?;
            }
            Ok(())
        })
    }

    pub fn add<S: PersistentStore + ?Sized>(
        &mut self,
        candidate: Schedule,
        store: &mut S,
    ) -> Result<SlotIndex, ScheduleError> {
        let candidate = Schedule::new(
            candidate.start_hour,
            candidate.start_minute,
            candidate.duration_secs,
        )?;
        let Some(index) = self.slots.iter().position(|slot| !slot.active) else {
            return Err(ScheduleError::CapacityExceeded {
                capacity: MAX_SCHEDULES,
            });
        };

        let previous = self.clone();
        self.slots[index] = Schedule {
            active: true,
            ..candidate
        };
        self.count = self.count.saturating_add(1);

        if let Err(err) = self.persist(store) {
            *self = previous;
            return Err(err);
        }

        info!(
            "schedule added in slot {index}: {:02}:{:02} for {}s",
            candidate.start_hour, candidate.start_minute, candidate.duration_secs
        );
        Ok(index)
    }

    pub fn delete<S: PersistentStore + ?Sized>(
        &mut self,
        index: SlotIndex,
        store: &mut S,
    ) -> Result<(), ScheduleError> {
        if index >= MAX_SCHEDULES {
            return Err(ScheduleError::IndexOutOfRange {
                index,
                capacity: MAX_SCHEDULES,
            });
        }

        let previous = self.slots[index];
        self.slots[index].active = false;
        if let Err(err) = self.persist(store) {
            self.slots[index] = previous;
            return Err(err);
        }

        info!("schedule slot {index} deleted");
        Ok(())
    }

    pub fn delete_all<S: PersistentStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<(), ScheduleError> {
        let previous = self.clone();
        for slot in &mut self.slots {
            slot.active = false;
        }
        self.count = 0;

        if let Err(err) = self.persist(store) {
            *self = previous;
            return Err(err);
        }

        info!("all schedules deleted");
        Ok(())
    }

    /// Active slots in ascending index order.
    pub fn active_schedules(&self) -> impl Iterator<Item = (SlotIndex, &Schedule)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
    }

    pub fn active_count(&self) -> usize {
        self.active_schedules().count()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn get(&self, index: SlotIndex) -> Option<&Schedule> {
        self.slots.get(index).filter(|slot| slot.active)
    }
}

fn slot_offset(index: SlotIndex) -> usize {
    COUNT_SIZE + index * SLOT_SIZE
}
