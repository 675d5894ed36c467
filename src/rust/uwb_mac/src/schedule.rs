// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! This module defines the schedule, the time windows given to each region, and the builders
//! which produce it.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::params::mac_types::{Dtu, RegionId};
use crate::utils::dtu_diff;

/// One window of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRegion {
    pub region_id: RegionId,
    /// The start of the window, from the start of the schedule period.
    pub start_offset_dtu: u32,
    /// None when the window never ends.
    pub duration_dtu: Option<u32>,
    /// The window exists in the first period only.
    pub once: bool,
}

impl ScheduleRegion {
    fn end_offset_dtu(&self) -> Option<u32> {
        self.duration_dtu.map(|duration| self.start_offset_dtu.saturating_add(duration))
    }

    fn contains(&self, offset_dtu: u32) -> bool {
        offset_dtu >= self.start_offset_dtu
            && self.end_offset_dtu().map_or(true, |end| offset_dtu < end)
    }
}

/// What covers a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleLookup {
    /// The window of a region, until `end_dtu` (None when endless).
    Region { region_id: RegionId, end_dtu: Option<Dtu> },
    /// No region until `until_dtu` (None when nothing follows).
    Idle { until_dtu: Option<Dtu> },
}

/// The ordered, non overlapping windows of the regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    start_dtu: Dtu,
    /// The period of the schedule, None when it does not repeat.
    period_dtu: Option<u32>,
    regions: Vec<ScheduleRegion>,
}

impl Schedule {
    pub fn new(start_dtu: Dtu, period_dtu: Option<u32>) -> Self {
        Self { start_dtu, period_dtu, regions: Vec::new() }
    }

    pub fn start_dtu(&self) -> Dtu {
        self.start_dtu
    }

    pub fn regions(&self) -> &[ScheduleRegion] {
        &self.regions
    }

    /// Append a window. Windows are added in time order and never overlap.
    pub fn add_region(&mut self, region: ScheduleRegion) -> Result<()> {
        if let Some(last) = self.regions.last() {
            match last.end_offset_dtu() {
                Some(end) if end <= region.start_offset_dtu => {}
                _ => {
                    warn!("Window {:?} overlaps {:?}", region, last);
                    return Err(Error::BadParameters);
                }
            }
        }
        if let (Some(period), end) = (self.period_dtu, region.end_offset_dtu()) {
            if end.map_or(true, |end| end > period) {
                warn!("Window {:?} exceeds the period {}", region, period);
                return Err(Error::BadParameters);
            }
        }
        self.regions.push(region);
        Ok(())
    }

    /// Find the window covering `timestamp_dtu`.
    pub fn find(&self, timestamp_dtu: Dtu) -> ScheduleLookup {
        let elapsed = dtu_diff(timestamp_dtu, self.start_dtu);
        if elapsed < 0 {
            return ScheduleLookup::Idle { until_dtu: Some(self.start_dtu) };
        }
        let elapsed = elapsed as u32;
        let (period_index, offset) = match self.period_dtu {
            Some(period) if period > 0 => (elapsed / period, elapsed % period),
            _ => (0, elapsed),
        };
        let period_start = timestamp_dtu.wrapping_sub(offset);
        let at = |offset_dtu: u32| period_start.wrapping_add(offset_dtu);

        let windows = self.regions.iter().filter(|r| !r.once || period_index == 0);
        for window in windows {
            if window.contains(offset) {
                return ScheduleLookup::Region {
                    region_id: window.region_id,
                    end_dtu: window.end_offset_dtu().map(at),
                };
            }
            if window.start_offset_dtu > offset {
                return ScheduleLookup::Idle { until_dtu: Some(at(window.start_offset_dtu)) };
            }
        }
        let next_period = self
            .period_dtu
            .filter(|_| self.regions.iter().any(|r| !r.once))
            .map(at);
        ScheduleLookup::Idle { until_dtu: next_period }
    }
}

/// The top level scheduler: it decides the windows of the regions.
pub trait ScheduleBuilder: 'static + Send {
    fn name(&self) -> &'static str;

    /// Build the schedule of `regions` starting at `start_dtu`.
    fn update_schedule(&mut self, start_dtu: Dtu, regions: &[RegionId]) -> Result<Schedule>;
}

/// Give all the time to the first region.
#[derive(Debug, Default)]
pub struct DefaultScheduler;

impl ScheduleBuilder for DefaultScheduler {
    fn name(&self) -> &'static str {
        "default"
    }

    fn update_schedule(&mut self, start_dtu: Dtu, regions: &[RegionId]) -> Result<Schedule> {
        let mut schedule = Schedule::new(start_dtu, None);
        if let Some(region_id) = regions.first() {
            if regions.len() > 1 {
                warn!("Only region {:?} is scheduled, {:?} get no time", region_id, &regions[1..]);
            }
            schedule.add_region(ScheduleRegion {
                region_id: *region_id,
                start_offset_dtu: 0,
                duration_dtu: None,
                once: false,
            })?;
        }
        Ok(schedule)
    }
}

/// Repeat a fixed window per region.
#[derive(Debug)]
pub struct TimeSlicedScheduler {
    slice_dtu: u32,
}

impl TimeSlicedScheduler {
    pub fn new(slice_dtu: u32) -> Option<Self> {
        match slice_dtu {
            0 => None,
            _ => Some(Self { slice_dtu }),
        }
    }
}

impl ScheduleBuilder for TimeSlicedScheduler {
    fn name(&self) -> &'static str {
        "time-sliced"
    }

    fn update_schedule(&mut self, start_dtu: Dtu, regions: &[RegionId]) -> Result<Schedule> {
        let period = self.slice_dtu.checked_mul(regions.len() as u32).ok_or(Error::BadParameters)?;
        let mut schedule = Schedule::new(start_dtu, Some(period));
        for (index, region_id) in regions.iter().enumerate() {
            schedule.add_region(ScheduleRegion {
                region_id: *region_id,
                start_offset_dtu: index as u32 * self.slice_dtu,
                duration_dtu: Some(self.slice_dtu),
                once: false,
            })?;
        }
        debug!("Time sliced schedule of {} regions, period {}", regions.len(), period);
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_windows_rejected() {
        let mut schedule = Schedule::new(0, None);
        let window = |start, duration| ScheduleRegion {
            region_id: RegionId(0),
            start_offset_dtu: start,
            duration_dtu: duration,
            once: false,
        };
        schedule.add_region(window(0, Some(100))).unwrap();
        assert_eq!(schedule.add_region(window(50, Some(100))), Err(Error::BadParameters));
        schedule.add_region(window(100, None)).unwrap();
        assert_eq!(schedule.add_region(window(500, Some(1))), Err(Error::BadParameters));
    }

    #[test]
    fn test_default_scheduler_endless() {
        let schedule = DefaultScheduler.update_schedule(1000, &[RegionId(3)]).unwrap();
        assert_eq!(schedule.find(500), ScheduleLookup::Idle { until_dtu: Some(1000) });
        assert_eq!(
            schedule.find(u32::MAX / 2),
            ScheduleLookup::Region { region_id: RegionId(3), end_dtu: None }
        );
        let empty = DefaultScheduler.update_schedule(0, &[]).unwrap();
        assert_eq!(empty.find(10), ScheduleLookup::Idle { until_dtu: None });
    }

    #[test]
    fn test_time_sliced_scheduler_repeats() {
        let mut builder = TimeSlicedScheduler::new(100).unwrap();
        let schedule = builder.update_schedule(0, &[RegionId(0), RegionId(1)]).unwrap();
        assert_eq!(
            schedule.find(50),
            ScheduleLookup::Region { region_id: RegionId(0), end_dtu: Some(100) }
        );
        assert_eq!(
            schedule.find(150),
            ScheduleLookup::Region { region_id: RegionId(1), end_dtu: Some(200) }
        );
        assert_eq!(
            schedule.find(1030),
            ScheduleLookup::Region { region_id: RegionId(0), end_dtu: Some(1100) }
        );
        assert!(TimeSlicedScheduler::new(0).is_none());
    }

    #[test]
    fn test_once_window() {
        let mut schedule = Schedule::new(0, Some(100));
        schedule
            .add_region(ScheduleRegion {
                region_id: RegionId(1),
                start_offset_dtu: 0,
                duration_dtu: Some(20),
                once: true,
            })
            .unwrap();
        schedule
            .add_region(ScheduleRegion {
                region_id: RegionId(0),
                start_offset_dtu: 50,
                duration_dtu: Some(50),
                once: false,
            })
            .unwrap();
        assert_eq!(
            schedule.find(10),
            ScheduleLookup::Region { region_id: RegionId(1), end_dtu: Some(20) }
        );
        assert_eq!(schedule.find(110), ScheduleLookup::Idle { until_dtu: Some(150) });
        assert_eq!(schedule.find(20), ScheduleLookup::Idle { until_dtu: Some(50) });
    }
}
