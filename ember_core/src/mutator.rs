use crate::state::{self, StateError};
use bincode::{Decode, Encode};
use log::debug;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Deserialize;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("Unknown mutator kind {0:?}")]
    UnknownKind(String),
    #[error("Invalid mutator options: {0}")]
    Options(String),
    #[error("Buffer of {available} bytes is too small, need at least {needed}")]
    BufferTooSmall { needed: usize, available: usize },
    /// A finite mutation schedule has run out.
    #[error("Mutator has no mutations left")]
    Exhausted,
    #[error(transparent)]
    State(#[from] StateError),
}

/// Behaviour switches for [`Mutator::mutate_extended`]. Bits an engine does
/// not know are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MutateFlags(u64);

impl MutateFlags {
    /// Output is never longer than the current input.
    pub const NO_GROW: MutateFlags = MutateFlags(1);
    /// Output is never shorter than the current input.
    pub const NO_SHRINK: MutateFlags = MutateFlags(1 << 1);

    pub const fn empty() -> Self {
        MutateFlags(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        MutateFlags(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: MutateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MutateFlags {
    type Output = MutateFlags;

    fn bitor(self, rhs: Self) -> Self {
        MutateFlags(self.0 | rhs.0)
    }
}

/// Produces variants of a seed input, one per call.
///
/// Dropping the mutator releases everything it holds.
pub trait Mutator: Send {
    fn kind(&self) -> MutatorKind;

    /// Writes the next variant into `buf` and returns its length, which never
    /// exceeds `buf.len()`.
    fn mutate(&mut self, buf: &mut [u8]) -> Result<usize, MutatorError> {
        self.mutate_extended(buf, MutateFlags::empty())
    }

    fn mutate_extended(&mut self, buf: &mut [u8], flags: MutateFlags)
    -> Result<usize, MutatorError>;

    fn get_state(&self) -> Result<Vec<u8>, MutatorError>;

    /// Restores a blob from [`get_state`]. Nothing changes if it is rejected.
    ///
    /// [`get_state`]: Mutator::get_state
    fn set_state(&mut self, state: &[u8]) -> Result<(), MutatorError>;

    /// Number of variants produced for the current input.
    fn current_iteration(&self) -> u64;

    /// Size of the mutation schedule, `None` if it is unbounded or unknown.
    fn total_iterations(&self) -> Option<u64>;

    /// Sizes of the inputs in use: the one being mutated first, then any
    /// secondary inputs it draws from.
    fn input_info(&self) -> Vec<usize>;

    /// Starts over on a new seed. Configuration is kept.
    fn set_input(&mut self, input: &[u8]);

    fn help(&self) -> &'static str {
        self.kind().help()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorKind {
    Havoc,
}

impl MutatorKind {
    pub fn name(self) -> &'static str {
        match self {
            MutatorKind::Havoc => "havoc",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            MutatorKind::Havoc => HavocMutator::HELP,
        }
    }
}

impl FromStr for MutatorKind {
    type Err = MutatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "havoc" => Ok(MutatorKind::Havoc),
            other => Err(MutatorError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for MutatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds a mutator for `input`, restoring `prior_state` if one is given.
pub fn create(
    kind: MutatorKind,
    options: &str,
    prior_state: Option<&[u8]>,
    input: &[u8],
) -> Result<Box<dyn Mutator>, MutatorError> {
    let mut mutator: Box<dyn Mutator> = match kind {
        MutatorKind::Havoc => {
            let options = if options.trim().is_empty() {
                HavocOptions::default()
            } else {
                serde_json::from_str(options).map_err(|e| MutatorError::Options(e.to_string()))?
            };
            Box::new(HavocMutator::new(options, input)?)
        }
    };
    if let Some(blob) = prior_state {
        mutator.set_state(blob)?;
    }
    debug!("created {kind} mutator for a {} byte input", input.len());
    Ok(mutator)
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HavocOptions {
    /// Fixed seed for reproducible output.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Each call stacks `2^k` operations, `k` drawn from `0..=max-stack-pow2`.
    #[serde(default = "default_max_stack_pow2")]
    pub max_stack_pow2: u32,
    #[serde(default)]
    pub dictionary: Vec<String>,
    /// Files whose contents are spliced into the input.
    #[serde(default)]
    pub splice: Vec<PathBuf>,
}

fn default_max_stack_pow2() -> u32 {
    4
}

impl Default for HavocOptions {
    fn default() -> Self {
        Self {
            seed: None,
            max_stack_pow2: default_max_stack_pow2(),
            dictionary: Vec::new(),
            splice: Vec::new(),
        }
    }
}

const ARITH_MAX: u32 = 35;
const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];
const HAVOC_BLK_SMALL: usize = 32;
const HAVOC_BLK_MEDIUM: usize = 128;
const HAVOC_BLK_LARGE: usize = 1500;
const HAVOC_BLK_XL: usize = 32768;
const MAX_STACK_POW2: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HavocOp {
    FlipBit,
    Interesting8,
    Interesting16,
    Interesting32,
    Arith8,
    Arith16,
    Arith32,
    RandomByte,
    DeleteBlock,
    InsertBlock,
    OverwriteBlock,
    DictOverwrite,
    DictInsert,
    Splice,
}

const BASE_OPS: [HavocOp; 11] = [
    HavocOp::FlipBit,
    HavocOp::Interesting8,
    HavocOp::Interesting16,
    HavocOp::Interesting32,
    HavocOp::Arith8,
    HavocOp::Arith16,
    HavocOp::Arith32,
    HavocOp::RandomByte,
    HavocOp::DeleteBlock,
    HavocOp::InsertBlock,
    HavocOp::OverwriteBlock,
];

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
struct HavocState {
    seed: [u8; 32],
    stream: u64,
    word_pos: u128,
    iteration: u64,
    max_stack_pow2: u32,
    input: Vec<u8>,
    dictionary: Vec<Vec<u8>>,
    splice: Vec<Vec<u8>>,
}

/// Stacked random mutations over a single seed.
pub struct HavocMutator {
    rng: ChaCha8Rng,
    max_stack_pow2: u32,
    input: Vec<u8>,
    dictionary: Vec<Vec<u8>>,
    splice: Vec<Vec<u8>>,
    iteration: u64,
}

impl HavocMutator {
    const VARIANT: &'static str = "havoc";
    const VERSION: u16 = 1;

    pub const HELP: &'static str = "\
havoc - stacks random bit flips, arithmetic, interesting values, block
        deletion/insertion/overwrite, dictionary tokens and splicing
Options (JSON object):
  seed             u64 seed for reproducible output (default random)
  max-stack-pow2   up to 2^n operations per call, 0-7 (default 4)
  dictionary       list of tokens to insert or overwrite with (default none)
  splice           list of files to splice from (default none)
";

    pub fn new(options: HavocOptions, input: &[u8]) -> Result<Self, MutatorError> {
        if options.max_stack_pow2 > MAX_STACK_POW2 {
            return Err(MutatorError::Options(format!(
                "max-stack-pow2 must be at most {MAX_STACK_POW2}, got {}",
                options.max_stack_pow2
            )));
        }
        let splice = options
            .splice
            .iter()
            .map(|path| {
                std::fs::read(path).map_err(|e| {
                    MutatorError::Options(format!("cannot read splice file {path:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            rng,
            max_stack_pow2: options.max_stack_pow2,
            input: input.to_vec(),
            dictionary: options
                .dictionary
                .into_iter()
                .map(String::into_bytes)
                .filter(|token| !token.is_empty())
                .collect(),
            splice,
            iteration: 0,
        })
    }

    fn available_ops(&self) -> Vec<HavocOp> {
        let mut ops = BASE_OPS.to_vec();
        if !self.dictionary.is_empty() {
            ops.extend([HavocOp::DictOverwrite, HavocOp::DictInsert]);
        }
        if !self.splice.is_empty() {
            ops.push(HavocOp::Splice);
        }
        ops
    }
}

impl Mutator for HavocMutator {
    fn kind(&self) -> MutatorKind {
        MutatorKind::Havoc
    }

    fn mutate_extended(
        &mut self,
        buf: &mut [u8],
        flags: MutateFlags,
    ) -> Result<usize, MutatorError> {
        let needed = self.input.len().max(1);
        if buf.len() < needed {
            return Err(MutatorError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }
        let cap = if flags.contains(MutateFlags::NO_GROW) {
            self.input.len()
        } else {
            buf.len()
        };

        let ops = self.available_ops();
        let mut stage = Stage {
            rng: &mut self.rng,
            work: self.input.clone(),
            cap,
            allow_shrink: !flags.contains(MutateFlags::NO_SHRINK),
            dictionary: &self.dictionary,
            splice: &self.splice,
        };
        let stack = 1usize << stage.rng.random_range(0..=self.max_stack_pow2);
        for _ in 0..stack {
            let op = ops[stage.rng.random_range(0..ops.len())];
            stage.apply(op);
        }
        if stage.work.is_empty() && stage.cap > 0 {
            let byte = stage.rng.random::<u8>();
            stage.work.push(byte);
        }

        let written = stage.work.len();
        buf[..written].copy_from_slice(&stage.work);
        self.iteration += 1;
        Ok(written)
    }

    fn get_state(&self) -> Result<Vec<u8>, MutatorError> {
        let snapshot = HavocState {
            seed: self.rng.get_seed(),
            stream: self.rng.get_stream(),
            word_pos: self.rng.get_word_pos(),
            iteration: self.iteration,
            max_stack_pow2: self.max_stack_pow2,
            input: self.input.clone(),
            dictionary: self.dictionary.clone(),
            splice: self.splice.clone(),
        };
        Ok(state::encode(Self::VARIANT, Self::VERSION, &snapshot)?)
    }

    fn set_state(&mut self, blob: &[u8]) -> Result<(), MutatorError> {
        let snapshot: HavocState = state::decode(Self::VARIANT, Self::VERSION, blob)?;
        if snapshot.max_stack_pow2 > MAX_STACK_POW2 {
            return Err(StateError::Invalid(format!(
                "stack depth exponent {} out of range",
                snapshot.max_stack_pow2
            ))
            .into());
        }
        let mut rng = ChaCha8Rng::from_seed(snapshot.seed);
        rng.set_stream(snapshot.stream);
        rng.set_word_pos(snapshot.word_pos);

        self.rng = rng;
        self.iteration = snapshot.iteration;
        self.max_stack_pow2 = snapshot.max_stack_pow2;
        self.input = snapshot.input;
        self.dictionary = snapshot.dictionary;
        self.splice = snapshot.splice;
        Ok(())
    }

    fn current_iteration(&self) -> u64 {
        self.iteration
    }

    fn total_iterations(&self) -> Option<u64> {
        None
    }

    fn input_info(&self) -> Vec<usize> {
        std::iter::once(self.input.len())
            .chain(self.splice.iter().map(Vec::len))
            .collect()
    }

    fn set_input(&mut self, input: &[u8]) {
        self.input = input.to_vec();
        self.iteration = 0;
    }
}

/// One `mutate` call in progress. `work` never grows past `cap`.
struct Stage<'a> {
    rng: &'a mut ChaCha8Rng,
    work: Vec<u8>,
    cap: usize,
    allow_shrink: bool,
    dictionary: &'a [Vec<u8>],
    splice: &'a [Vec<u8>],
}

impl<'a> Stage<'a> {
    fn apply(&mut self, op: HavocOp) {
        let len = self.work.len();
        match op {
            HavocOp::FlipBit => {
                if len == 0 {
                    return;
                }
                let bit = self.rng.random_range(0..len * 8);
                self.work[bit >> 3] ^= 128 >> (bit & 7);
            }
            HavocOp::Interesting8 => {
                if len == 0 {
                    return;
                }
                let pos = self.rng.random_range(0..len);
                let value = INTERESTING_8[self.rng.random_range(0..INTERESTING_8.len())];
                self.work[pos] = value as u8;
            }
            HavocOp::Interesting16 => {
                if len < 2 {
                    return;
                }
                let pos = self.rng.random_range(0..=len - 2);
                let value = INTERESTING_16[self.rng.random_range(0..INTERESTING_16.len())];
                let bytes = if self.rng.random_bool(0.5) {
                    value.to_le_bytes()
                } else {
                    value.to_be_bytes()
                };
                self.work[pos..pos + 2].copy_from_slice(&bytes);
            }
            HavocOp::Interesting32 => {
                if len < 4 {
                    return;
                }
                let pos = self.rng.random_range(0..=len - 4);
                let value = INTERESTING_32[self.rng.random_range(0..INTERESTING_32.len())];
                let bytes = if self.rng.random_bool(0.5) {
                    value.to_le_bytes()
                } else {
                    value.to_be_bytes()
                };
                self.work[pos..pos + 4].copy_from_slice(&bytes);
            }
            HavocOp::Arith8 => {
                if len == 0 {
                    return;
                }
                let pos = self.rng.random_range(0..len);
                let delta = self.rng.random_range(1..=ARITH_MAX) as u8;
                self.work[pos] = if self.rng.random_bool(0.5) {
                    self.work[pos].wrapping_add(delta)
                } else {
                    self.work[pos].wrapping_sub(delta)
                };
            }
            HavocOp::Arith16 => {
                if len < 2 {
                    return;
                }
                let pos = self.rng.random_range(0..=len - 2);
                let delta = self.rng.random_range(1..=ARITH_MAX) as u16;
                let big_endian = self.rng.random_bool(0.5);
                let add = self.rng.random_bool(0.5);
                let field = [self.work[pos], self.work[pos + 1]];
                let value = if big_endian {
                    u16::from_be_bytes(field)
                } else {
                    u16::from_le_bytes(field)
                };
                let value = if add {
                    value.wrapping_add(delta)
                } else {
                    value.wrapping_sub(delta)
                };
                let bytes = if big_endian {
                    value.to_be_bytes()
                } else {
                    value.to_le_bytes()
                };
                self.work[pos..pos + 2].copy_from_slice(&bytes);
            }
            HavocOp::Arith32 => {
                if len < 4 {
                    return;
                }
                let pos = self.rng.random_range(0..=len - 4);
                let delta = self.rng.random_range(1..=ARITH_MAX);
                let big_endian = self.rng.random_bool(0.5);
                let add = self.rng.random_bool(0.5);
                let mut field = [0u8; 4];
                field.copy_from_slice(&self.work[pos..pos + 4]);
                let value = if big_endian {
                    u32::from_be_bytes(field)
                } else {
                    u32::from_le_bytes(field)
                };
                let value = if add {
                    value.wrapping_add(delta)
                } else {
                    value.wrapping_sub(delta)
                };
                let bytes = if big_endian {
                    value.to_be_bytes()
                } else {
                    value.to_le_bytes()
                };
                self.work[pos..pos + 4].copy_from_slice(&bytes);
            }
            HavocOp::RandomByte => {
                if len == 0 {
                    return;
                }
                let pos = self.rng.random_range(0..len);
                self.work[pos] ^= self.rng.random_range(1..=255u8);
            }
            HavocOp::DeleteBlock => {
                if !self.allow_shrink || len < 2 {
                    return;
                }
                let del_len = self.choose_block_len(len - 1);
                let del_from = self.rng.random_range(0..=len - del_len);
                self.work.drain(del_from..del_from + del_len);
            }
            HavocOp::InsertBlock => {
                let room = self.cap.saturating_sub(len);
                if room == 0 {
                    self.apply(HavocOp::OverwriteBlock);
                    return;
                }
                let block = if len > 0 && self.rng.random_bool(0.75) {
                    let clone_len = self.choose_block_len(len).min(room);
                    let clone_from = self.rng.random_range(0..=len - clone_len);
                    self.work[clone_from..clone_from + clone_len].to_vec()
                } else {
                    let fill_len = self.choose_block_len(HAVOC_BLK_XL).min(room);
                    vec![self.fill_byte(); fill_len]
                };
                let clone_to = self.rng.random_range(0..=len);
                self.work.splice(clone_to..clone_to, block);
            }
            HavocOp::OverwriteBlock => {
                if len < 2 {
                    return;
                }
                let copy_len = self.choose_block_len(len - 1);
                let copy_from = self.rng.random_range(0..=len - copy_len);
                let copy_to = self.rng.random_range(0..=len - copy_len);
                if self.rng.random_bool(0.75) {
                    self.work
                        .copy_within(copy_from..copy_from + copy_len, copy_to);
                } else {
                    let fill = self.fill_byte();
                    self.work[copy_to..copy_to + copy_len].fill(fill);
                }
            }
            HavocOp::DictOverwrite => {
                let Some(token) = self.pick_token() else { return };
                if token.len() > len {
                    return;
                }
                let pos = self.rng.random_range(0..=len - token.len());
                self.work[pos..pos + token.len()].copy_from_slice(token);
            }
            HavocOp::DictInsert => {
                let Some(token) = self.pick_token() else { return };
                if len + token.len() > self.cap {
                    if token.len() <= len {
                        let pos = self.rng.random_range(0..=len - token.len());
                        self.work[pos..pos + token.len()].copy_from_slice(token);
                    }
                    return;
                }
                let pos = self.rng.random_range(0..=len);
                self.work.splice(pos..pos, token.iter().copied());
            }
            HavocOp::Splice => self.splice_from_seed(),
        }
    }

    fn fill_byte(&mut self) -> u8 {
        if !self.work.is_empty() && self.rng.random_bool(0.5) {
            self.work[self.rng.random_range(0..self.work.len())]
        } else {
            self.rng.random()
        }
    }

    fn pick_token(&mut self) -> Option<&'a [u8]> {
        let dictionary = self.dictionary;
        if dictionary.is_empty() {
            return None;
        }
        Some(&dictionary[self.rng.random_range(0..dictionary.len())])
    }

    /// Keeps the head of the input and takes the tail from another seed,
    /// cutting somewhere between the first and last bytes where they differ.
    fn splice_from_seed(&mut self) {
        let seeds = self.splice;
        if seeds.is_empty() {
            return;
        }
        let other = &seeds[self.rng.random_range(0..seeds.len())];
        let limit = self.work.len().min(other.len());
        if limit < 2 {
            return;
        }
        let differs = |i: &usize| self.work[*i] != other[*i];
        let (Some(first), Some(last)) = (
            (0..limit).find(differs),
            (0..limit).rev().find(differs),
        ) else {
            return;
        };
        if last < first + 2 {
            return;
        }
        let split = self.rng.random_range(first..last);
        let mut spliced = self.work[..split].to_vec();
        spliced.extend_from_slice(&other[split..]);
        spliced.truncate(self.cap);
        if !self.allow_shrink && spliced.len() < self.work.len() {
            return;
        }
        self.work = spliced;
    }

    fn choose_block_len(&mut self, limit: usize) -> usize {
        let (mut min_value, max_value) = match self.rng.random_range(0..3) {
            0 => (1, HAVOC_BLK_SMALL),
            1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
            _ => {
                if self.rng.random_bool(0.9) {
                    (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
                } else {
                    (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
                }
            }
        };
        if min_value >= limit {
            min_value = 1;
        }
        self.rng.random_range(min_value..=max_value.min(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64, input: &[u8]) -> HavocMutator {
        HavocMutator::new(
            HavocOptions {
                seed: Some(seed),
                dictionary: vec!["FUZZ".to_string(), "\u{7f}ELF".to_string()],
                ..Default::default()
            },
            input,
        )
        .unwrap()
    }

    fn outputs(mutator: &mut dyn Mutator, count: usize, cap: usize) -> Vec<Vec<u8>> {
        let mut buf = vec![0u8; cap];
        (0..count)
            .map(|_| {
                let written = mutator.mutate(&mut buf).unwrap();
                buf[..written].to_vec()
            })
            .collect()
    }

    #[test]
    fn kinds_and_options_parse() {
        assert_eq!("havoc".parse::<MutatorKind>().unwrap(), MutatorKind::Havoc);
        assert!(matches!("radamsa".parse::<MutatorKind>(), Err(MutatorError::UnknownKind(_))));

        let mutator =
            create(MutatorKind::Havoc, r#"{"seed": 7, "max-stack-pow2": 2}"#, None, b"ab").unwrap();
        assert_eq!(mutator.total_iterations(), None);
        assert!(mutator.help().contains("max-stack-pow2"));

        assert!(matches!(
            create(MutatorKind::Havoc, r#"{"max-stack-pow2": 8}"#, None, b"ab"),
            Err(MutatorError::Options(_))
        ));
        assert!(matches!(
            create(MutatorKind::Havoc, r#"{"rounds": 3}"#, None, b"ab"),
            Err(MutatorError::Options(_))
        ));
    }

    #[test]
    fn buffer_smaller_than_the_input_is_refused() {
        let mut mutator = seeded(1, &[0x41; 8]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            mutator.mutate(&mut buf),
            Err(MutatorError::BufferTooSmall { needed: 8, available: 4 })
        ));
        assert_eq!(buf, [0u8; 4]);
        assert_eq!(mutator.current_iteration(), 0);
    }

    #[test]
    fn output_always_fits_the_buffer() {
        let splice_dir = tempfile::tempdir().unwrap();
        let splice_path = splice_dir.path().join("other");
        std::fs::write(&splice_path, b"a completely different seed of some length").unwrap();

        for cap in (1..=96).chain([512, 4096]) {
            let input: Vec<u8> = (0..cap.min(24) as u8).collect();
            let mut mutator = HavocMutator::new(
                HavocOptions {
                    seed: Some(cap as u64),
                    max_stack_pow2: 7,
                    dictionary: vec!["tokentokentoken".to_string()],
                    splice: vec![splice_path.clone()],
                },
                &input,
            )
            .unwrap();

            let mut backing = vec![0xa5u8; cap + 32];
            for _ in 0..64 {
                let written = mutator.mutate(&mut backing[..cap]).unwrap();
                assert!(written <= cap, "wrote {written} into {cap}");
                assert!(backing[cap..].iter().all(|&b| b == 0xa5));
            }
        }
    }

    #[test]
    fn same_seed_same_outputs() {
        let mut a = seeded(42, b"the quick brown fox");
        let mut b = seeded(42, b"the quick brown fox");
        let mut c = seeded(43, b"the quick brown fox");
        let from_a = outputs(&mut a, 50, 256);
        assert_eq!(from_a, outputs(&mut b, 50, 256));
        assert_ne!(from_a, outputs(&mut c, 50, 256));
        assert_eq!(a.current_iteration(), 50);
    }

    #[test]
    fn restored_state_continues_the_same_sequence() {
        let mut original = seeded(9, b"GET /index.html HTTP/1.1");
        outputs(&mut original, 10, 128);
        let blob = original.get_state().unwrap();

        let mut restored = create(MutatorKind::Havoc, "", Some(&blob), b"ignored").unwrap();
        assert_eq!(restored.current_iteration(), 10);
        assert_eq!(restored.input_info(), original.input_info());
        assert_eq!(outputs(&mut original, 20, 128), outputs(restored.as_mut(), 20, 128));
    }

    #[test]
    fn rejected_state_leaves_the_mutator_alone() {
        let mut mutator = seeded(3, b"abcdef");
        outputs(&mut mutator, 3, 64);
        let before = mutator.get_state().unwrap();

        assert!(mutator.set_state(b"junk").is_err());
        let mut truncated = before.clone();
        truncated.truncate(before.len() / 2);
        assert!(mutator.set_state(&truncated).is_err());

        assert_eq!(mutator.get_state().unwrap(), before);
    }

    #[test]
    fn set_input_resets_the_iteration_counter() {
        let mut mutator = seeded(5, b"abc");
        outputs(&mut mutator, 4, 64);
        assert_eq!(mutator.current_iteration(), 4);

        mutator.set_input(b"a longer replacement input");
        assert_eq!(mutator.current_iteration(), 0);
        assert_eq!(mutator.input_info(), vec![26]);
    }

    #[test]
    fn input_info_lists_splice_seeds_after_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        let long = dir.path().join("long");
        std::fs::write(&short, b"xyz").unwrap();
        std::fs::write(&long, [7u8; 40]).unwrap();

        let mut mutator = HavocMutator::new(
            HavocOptions {
                seed: Some(1),
                splice: vec![short, long],
                ..Default::default()
            },
            b"seed input",
        )
        .unwrap();
        assert_eq!(mutator.input_info(), vec![10, 3, 40]);

        mutator.set_input(b"ab");
        assert_eq!(mutator.input_info(), vec![2, 3, 40]);
    }

    #[test]
    fn flags_bound_the_output_length() {
        let input = b"0123456789abcdef";
        let mut mutator = seeded(11, input);
        let mut buf = [0u8; 256];
        for _ in 0..200 {
            let written = mutator
                .mutate_extended(&mut buf, MutateFlags::NO_GROW)
                .unwrap();
            assert!(written <= input.len());
        }
        for _ in 0..200 {
            let written = mutator
                .mutate_extended(&mut buf, MutateFlags::NO_SHRINK | MutateFlags::from_bits(1 << 40))
                .unwrap();
            assert!(written >= input.len());
        }
    }

    #[test]
    fn empty_input_still_yields_bytes() {
        let mut mutator = seeded(13, b"");
        let mut buf = [0u8; 8];
        for _ in 0..20 {
            assert!(mutator.mutate(&mut buf).unwrap() >= 1);
        }
    }
}
