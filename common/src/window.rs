use chrono::{NaiveTime, Timelike};

use crate::schedule::{Schedule, SlotIndex};

pub fn seconds_since_midnight(time: NaiveTime) -> u32 {
    time.num_seconds_from_midnight()
}

/// Output level for `now_secs`: the activated level (`!default_level`) if any
/// window covers it, `default_level` otherwise.
///
/// Windows are half-open and never wrap past midnight; the first match in
/// slot order wins.
pub fn evaluate<'a, I>(now_secs: u32, schedules: I, default_level: bool) -> bool
where
    I: IntoIterator<Item = (SlotIndex, &'a Schedule)>,
{
    let now = now_secs as u64;
    let matched = schedules.into_iter().find(|(_, schedule)| {
        let start = schedule.window_start_secs() as u64;
        start <= now && now < schedule.window_end_secs()
    });

    match matched {
        Some(_) => !default_level,
        None => default_level,
    }
}
