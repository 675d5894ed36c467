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

//! This module elects, inside one region, the session which gets the next access.
//!
//! Two algorithms are available:
//! * [`SchedulingMode::Deterministic`]: the earliest demand wins, and an elected session keeps the
//!   radio for `consecutive_schedule_min` consecutive accesses.
//! * [`SchedulingMode::Fair`]: the sessions whose demands overlap share the conflict in proportion
//!   of their priority. The share is added to a per-session deficit, which counts the radio time
//!   owed to the session, and the session with the largest deficit wins. The winner pays back the
//!   time it consumed once the access is done.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::{debug, warn};

use crate::params::mac_types::{Dtu, SessionHandle};
use crate::utils::dtu_diff;

/// The demand of a session for the next access opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDemand {
    /// The start of the block the access belongs to.
    pub block_start_dtu: Dtu,
    /// The start of the access.
    pub timestamp_dtu: Dtu,
    /// The expected duration of the access.
    pub duration_dtu: u32,
    /// The largest duration the access may take, None when unbounded.
    pub max_duration_dtu: Option<u32>,
    pub round_index: u32,
    /// The number of blocks skipped after this access.
    pub add_blocks: u32,
    /// The timeout of the first reception of the access, 0 when the access starts with a
    /// transmission.
    pub rx_timeout_dtu: u32,
}

impl SessionDemand {
    fn end_dtu(&self) -> Dtu {
        self.timestamp_dtu.wrapping_add(self.duration_dtu)
    }

    /// The length of the intersection of the two demand windows.
    fn overlap(&self, other: &SessionDemand) -> u32 {
        let start = match dtu_diff(self.timestamp_dtu, other.timestamp_dtu) >= 0 {
            true => self.timestamp_dtu,
            false => other.timestamp_dtu,
        };
        let end = match dtu_diff(self.end_dtu(), other.end_dtu()) <= 0 {
            true => self.end_dtu(),
            false => other.end_dtu(),
        };
        dtu_diff(end, start).max(0) as u32
    }
}

/// A session with a demand, offered to the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub handle: SessionHandle,
    pub demand: SessionDemand,
}

/// The session elected for an access, with the scheduler changes it brings once committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub elected: Candidate,
    /// The deficit added to each session of the conflict, in fair mode.
    contributions: Vec<(SessionHandle, i32)>,
}

impl Election {
    fn new(elected: Candidate) -> Self {
        Self { elected, contributions: Vec::new() }
    }
}

/// The election algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    #[default]
    Deterministic,
    Fair,
}

/// The scheduler state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSessionInfo {
    pub priority: u8,
    pub consecutive_schedule_min: u8,
    /// The radio time owed to the session. Saturates at the bounds of i32.
    pub deficit: i32,
    /// The remaining accesses the session keeps once elected, in deterministic mode.
    pub remaining_consecutive: u8,
    pub last_access_dtu: Option<Dtu>,
}

impl SchedulerSessionInfo {
    fn new(priority: u8, consecutive_schedule_min: u8) -> Self {
        Self {
            priority: priority.max(1),
            consecutive_schedule_min: consecutive_schedule_min.max(1),
            deficit: 0,
            remaining_consecutive: 0,
            last_access_dtu: None,
        }
    }

    fn reset(&mut self) {
        self.deficit = 0;
        self.remaining_consecutive = 0;
        self.last_access_dtu = None;
    }
}

/// The session scheduler of one region.
#[derive(Debug, Default)]
pub struct SessionScheduler {
    mode: SchedulingMode,
    infos: BTreeMap<SessionHandle, SchedulerSessionInfo>,
    previous: Option<SessionHandle>,
}

impl SessionScheduler {
    pub fn new(mode: SchedulingMode) -> Self {
        Self { mode, infos: BTreeMap::new(), previous: None }
    }

    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    /// Change the algorithm. The state of every session is reset.
    pub fn set_mode(&mut self, mode: SchedulingMode) {
        if self.mode == mode {
            return;
        }
        debug!("Session scheduling mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        self.previous = None;
        self.infos.values_mut().for_each(SchedulerSessionInfo::reset);
    }

    /// Register a session, or reset it if it is already known.
    pub fn add_session(&mut self, handle: SessionHandle, priority: u8, consecutive_min: u8) {
        self.infos.insert(handle, SchedulerSessionInfo::new(priority, consecutive_min));
        if self.previous == Some(handle) {
            self.previous = None;
        }
    }

    /// Update the scheduling parameters of a session, keeping its running state.
    pub fn update_session(&mut self, handle: SessionHandle, priority: u8, consecutive_min: u8) {
        if let Some(info) = self.infos.get_mut(&handle) {
            info.priority = priority.max(1);
            info.consecutive_schedule_min = consecutive_min.max(1);
        }
    }

    pub fn remove_session(&mut self, handle: SessionHandle) {
        self.infos.remove(&handle);
        if self.previous == Some(handle) {
            self.previous = None;
        }
    }

    pub fn session_info(&self, handle: SessionHandle) -> Option<&SchedulerSessionInfo> {
        self.infos.get(&handle)
    }

    /// Elect the session which gets the access, among the candidates.
    ///
    /// The result only depends on the candidates and on the state of the scheduler, which is left
    /// untouched until the election is committed.
    pub fn elect(&self, next_timestamp_dtu: Dtu, candidates: &[Candidate]) -> Option<Election> {
        let candidates: Vec<Candidate> =
            candidates.iter().filter(|c| self.infos.contains_key(&c.handle)).copied().collect();
        let election = match candidates.len() {
            0 => return None,
            1 => Election::new(candidates[0]),
            _ => match self.mode {
                SchedulingMode::Deterministic => {
                    Election::new(self.elect_deterministic(next_timestamp_dtu, &candidates))
                }
                SchedulingMode::Fair => self.elect_fair(next_timestamp_dtu, &candidates),
            },
        };
        debug!(
            "Elected session {} among {} candidates",
            election.elected.handle,
            candidates.len()
        );
        Some(election)
    }

    /// Apply an election whose session took the access.
    pub fn commit(&mut self, election: &Election) {
        for (handle, contribution) in election.contributions.iter() {
            if let Some(info) = self.infos.get_mut(handle) {
                info.deficit = info.deficit.saturating_add(*contribution);
            }
        }
        let handle = election.elected.handle;
        let consecutive = self.previous == Some(handle);
        if let Some(info) = self.infos.get_mut(&handle) {
            info.remaining_consecutive = match consecutive {
                true => info.remaining_consecutive.saturating_sub(1),
                false => info.consecutive_schedule_min - 1,
            };
        }
        self.previous = Some(handle);
    }

    /// Account the access of the elected session.
    pub fn access_done(&mut self, handle: SessionHandle, timestamp_dtu: Dtu, consumed_dtu: u32) {
        match self.infos.get_mut(&handle) {
            Some(info) => {
                info.last_access_dtu = Some(timestamp_dtu);
                if self.mode == SchedulingMode::Fair {
                    let consumed = i32::try_from(consumed_dtu).unwrap_or(i32::MAX);
                    info.deficit = info.deficit.saturating_sub(consumed);
                }
            }
            None => warn!("access_done for the unknown session {}", handle),
        }
    }

    /// The order of the candidates: the earliest demand, then the longest waiting session, then
    /// the smallest handle.
    fn compare(&self, next_timestamp_dtu: Dtu, a: &Candidate, b: &Candidate) -> Ordering {
        let a_offset = dtu_diff(a.demand.timestamp_dtu, next_timestamp_dtu);
        let b_offset = dtu_diff(b.demand.timestamp_dtu, next_timestamp_dtu);
        a_offset
            .cmp(&b_offset)
            .then_with(|| self.compare_last_access(next_timestamp_dtu, a.handle, b.handle))
            .then_with(|| a.handle.cmp(&b.handle))
    }

    fn compare_last_access(&self, now: Dtu, a: SessionHandle, b: SessionHandle) -> Ordering {
        let last_access = |handle| self.infos.get(&handle).and_then(|info| info.last_access_dtu);
        match (last_access(a), last_access(b)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            // The oldest access is the farthest from now.
            (Some(a), Some(b)) => dtu_diff(now, b).cmp(&dtu_diff(now, a)),
        }
    }

    fn elect_deterministic(&self, next_timestamp_dtu: Dtu, candidates: &[Candidate]) -> Candidate {
        if let Some(previous) = self.previous {
            let remaining =
                self.infos.get(&previous).map(|info| info.remaining_consecutive).unwrap_or(0);
            let previous_candidate = candidates.iter().find(|c| c.handle == previous);
            if let Some(candidate) = previous_candidate {
                if remaining > 0 {
                    return *candidate;
                }
            }
        }

        // The previous session used all its consecutive accesses: let the others go first.
        let others: Vec<&Candidate> = match self.previous {
            Some(previous) => candidates.iter().filter(|c| c.handle != previous).collect(),
            None => candidates.iter().collect(),
        };
        let pool: Vec<&Candidate> = match others.is_empty() {
            true => candidates.iter().collect(),
            false => others,
        };
        pool.into_iter()
            .min_by(|a, b| self.compare(next_timestamp_dtu, a, b))
            .copied()
            .unwrap_or(candidates[0])
    }

    fn elect_fair(&self, next_timestamp_dtu: Dtu, candidates: &[Candidate]) -> Election {
        let earliest = candidates
            .iter()
            .min_by(|a, b| self.compare(next_timestamp_dtu, a, b))
            .copied()
            .unwrap_or(candidates[0]);
        let conflict: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.handle == earliest.handle || c.demand.overlap(&earliest.demand) > 0)
            .copied()
            .collect();
        if conflict.len() == 1 {
            return Election::new(earliest);
        }

        let priority_sum: u64 = conflict
            .iter()
            .map(|c| self.infos.get(&c.handle).map(|info| info.priority as u64).unwrap_or(1))
            .sum();
        let contributions: Vec<(SessionHandle, i32)> = conflict
            .iter()
            .map(|candidate| {
                let overlap = conflict
                    .iter()
                    .filter(|other| other.handle != candidate.handle)
                    .map(|other| candidate.demand.overlap(&other.demand))
                    .max()
                    .unwrap_or(0);
                let priority =
                    self.infos.get(&candidate.handle).map(|info| info.priority as u64).unwrap_or(1);
                let contribution = overlap as u64 * priority / priority_sum;
                (candidate.handle, i32::try_from(contribution).unwrap_or(i32::MAX))
            })
            .collect();

        let deficit = |handle| {
            let contribution =
                contributions.iter().find(|(h, _)| *h == handle).map(|(_, c)| *c).unwrap_or(0);
            self.infos
                .get(&handle)
                .map(|info| info.deficit.saturating_add(contribution))
                .unwrap_or(contribution)
        };
        let elected = conflict
            .iter()
            .min_by(|a, b| {
                deficit(b.handle)
                    .cmp(&deficit(a.handle))
                    .then_with(|| self.compare_last_access(next_timestamp_dtu, a.handle, b.handle))
                    .then_with(|| a.handle.cmp(&b.handle))
            })
            .copied()
            .unwrap_or(earliest);
        Election { elected, contributions }
    }
}
