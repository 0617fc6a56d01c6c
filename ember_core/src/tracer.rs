//! Target-side coverage recording.
//!
//! Runs inside the instrumented process. Configuration is resolved once into
//! a [`TraceConfig`]; the supervisor produces the matching variables through
//! [`TraceConfig::env_vars`].

use crate::coverage::{CoverageError, CoverageRegion, MAP_SIZE};
use std::ops::Range;
use thiserror::Error;

/// Shared memory segment id of the coverage region.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Percentage of coverage slots that record.
pub const INST_RATIO_VAR: &str = "AFL_INST_RATIO";
/// Any value widens instrumentation to the whole address space.
pub const INST_LIBS_VAR: &str = "AFL_INST_LIBS";

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Invalid shared memory id {0:?}")]
    InvalidShmId(String),
    #[error("Invalid instrumentation ratio {0:?}")]
    InvalidRatio(String),
    #[error(transparent)]
    Region(#[from] CoverageError),
}

impl SetupError {
    /// Exit status used when setup fails inside a target process.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub shm_id: Option<i32>,
    /// Clamped to `1..=100` when present.
    pub inst_ratio: Option<u32>,
    pub instrument_libraries: bool,
}

impl TraceConfig {
    pub fn from_env() -> Result<Self, SetupError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SetupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shm_id = match lookup(SHM_ENV_VAR) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<i32>()
                    .map_err(|_| SetupError::InvalidShmId(raw.clone()))?,
            ),
            None => None,
        };
        let inst_ratio = match lookup(INST_RATIO_VAR) {
            Some(raw) => Some(parse_ratio(&raw)?),
            None => None,
        };
        Ok(Self {
            shm_id,
            inst_ratio,
            instrument_libraries: lookup(INST_LIBS_VAR).is_some(),
        })
    }

    /// Number of map slots that participate in recording.
    pub fn instrumented_slots(&self) -> usize {
        match self.inst_ratio {
            Some(ratio) => MAP_SIZE * ratio as usize / 100,
            None => MAP_SIZE,
        }
    }

    /// Variables that reproduce this configuration in a child process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(id) = self.shm_id {
            vars.push((SHM_ENV_VAR, id.to_string()));
        }
        if let Some(ratio) = self.inst_ratio {
            vars.push((INST_RATIO_VAR, ratio.to_string()));
        }
        if self.instrument_libraries {
            vars.push((INST_LIBS_VAR, "1".to_string()));
        }
        vars
    }
}

/// Parses a ratio the way the instrumentation expects it: above 100 is
/// clamped, zero becomes one.
pub fn parse_ratio(raw: &str) -> Result<u32, SetupError> {
    let ratio = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| SetupError::InvalidRatio(raw.to_string()))?;
    Ok(ratio.clamp(1, 100) as u32)
}

/// Records control-flow edges into the coverage region.
#[derive(Debug)]
pub struct Tracer {
    region: CoverageRegion,
    inst_rms: usize,
    code_range: Range<u64>,
    prev_loc: u64,
}

impl Tracer {
    /// Attaches the region named by `config` (or a private one if there is
    /// none). `code_range` is the target's own code; it is widened to the
    /// whole address space when libraries are instrumented.
    pub fn setup(config: &TraceConfig, code_range: Range<u64>) -> Result<Self, SetupError> {
        let mut region = match config.shm_id {
            Some(id) => CoverageRegion::attach(id, MAP_SIZE)?,
            None => CoverageRegion::local(MAP_SIZE),
        };

        // With a low ratio the run may record nothing at all; touch the map
        // so the supervisor does not give up on the target.
        if config.inst_ratio.is_some() && region.is_shared() {
            region.as_mut_slice()[0] = 1;
        }

        let code_range = if config.instrument_libraries {
            0..u64::MAX
        } else {
            code_range
        };

        Ok(Self {
            region,
            inst_rms: config.instrumented_slots(),
            code_range,
            prev_loc: 0,
        })
    }

    pub fn inst_rms(&self) -> usize {
        self.inst_rms
    }

    pub fn code_range(&self) -> &Range<u64> {
        &self.code_range
    }

    pub fn region(&self) -> &CoverageRegion {
        &self.region
    }

    /// Records the edge from the previous location to `pc`.
    pub fn record(&mut self, pc: u64) {
        if !self.code_range.contains(&pc) {
            return;
        }

        let mut cur_loc = (pc >> 4) ^ (pc << 8);
        cur_loc &= (MAP_SIZE - 1) as u64;

        if cur_loc as usize >= self.inst_rms {
            return;
        }

        let slot = ((cur_loc ^ self.prev_loc) as usize) & (MAP_SIZE - 1);
        let map = self.region.as_mut_slice();
        map[slot] = map[slot].wrapping_add(1);
        self.prev_loc = cur_loc >> 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn unset_ratio_instruments_the_whole_map() {
        let config = TraceConfig::from_lookup(lookup_from(&[(SHM_ENV_VAR, "12345")])).unwrap();
        assert_eq!(config.shm_id, Some(12345));
        assert_eq!(config.inst_ratio, None);
        assert_eq!(config.instrumented_slots(), MAP_SIZE);
    }

    #[test]
    fn ratio_is_clamped_and_scaled() {
        let config = TraceConfig::from_lookup(lookup_from(&[(INST_RATIO_VAR, "10")])).unwrap();
        assert_eq!(config.instrumented_slots(), MAP_SIZE * 10 / 100);
        assert_eq!(parse_ratio("0").unwrap(), 1);
        assert_eq!(parse_ratio("250").unwrap(), 100);
        assert!(matches!(parse_ratio("ten"), Err(SetupError::InvalidRatio(_))));
    }

    #[test]
    fn bad_shm_id_is_rejected() {
        let err = TraceConfig::from_lookup(lookup_from(&[(SHM_ENV_VAR, "abc")])).unwrap_err();
        assert!(matches!(err, SetupError::InvalidShmId(_)));
    }

    #[test]
    fn env_vars_round_trip_through_lookup() {
        let config = TraceConfig {
            shm_id: Some(77),
            inst_ratio: Some(40),
            instrument_libraries: true,
        };
        let vars: Vec<(String, String)> = config
            .env_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = TraceConfig::from_lookup(|name| {
            vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
        })
        .unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn setup_with_ratio_pre_touches_the_shared_map() {
        let owner = CoverageRegion::create(MAP_SIZE).unwrap();
        let config = TraceConfig {
            shm_id: owner.id(),
            inst_ratio: Some(10),
            instrument_libraries: false,
        };
        let tracer = Tracer::setup(&config, 0x1000..0x2000).unwrap();
        assert_eq!(tracer.inst_rms(), MAP_SIZE / 10);
        assert_ne!(owner.as_slice()[0], 0);
    }

    #[test]
    fn setup_without_ratio_leaves_the_map_clean() {
        let owner = CoverageRegion::create(MAP_SIZE).unwrap();
        let config = TraceConfig { shm_id: owner.id(), ..Default::default() };
        let tracer = Tracer::setup(&config, 0..10).unwrap();
        assert_eq!(tracer.inst_rms(), MAP_SIZE);
        assert!(owner.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn instrumenting_libraries_widens_the_range() {
        let config = TraceConfig { instrument_libraries: true, ..Default::default() };
        let tracer = Tracer::setup(&config, 0x1000..0x2000).unwrap();
        assert_eq!(tracer.code_range(), &(0..u64::MAX));
    }

    #[test]
    fn record_skips_out_of_range_pcs_and_fills_in_range_ones() {
        let config = TraceConfig::default();
        let mut tracer = Tracer::setup(&config, 0x1000..0x2000).unwrap();
        tracer.record(0x10);
        tracer.record(0x2000);
        assert!(tracer.region().as_slice().iter().all(|&b| b == 0));

        tracer.record(0x1010);
        tracer.record(0x1020);
        let total: u32 = tracer.region().as_slice().iter().map(|&b| b as u32).sum();
        assert_eq!(total, 2);
    }
}
