//! The choice ledger and the split byte providers handed to generators.
//!
//! Every primitive draw a generator performs consumes bytes from one shared
//! buffer and appends exactly one [`Choice`] to the ledger of the channel the
//! draw belongs to. The recorded ranges partition the consumed prefix of the
//! buffer exactly, which is what later allows targeted mutation to overwrite
//! one generator decision without corrupting its neighbours.

use std::fmt;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::input::InputRecord;

/// The two independently addressable byte channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Control decisions of the generator: how many elements, which
    /// alternative.
    Structure,
    /// Concrete leaf data.
    Value,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Structure => f.write_str("structure"),
            Channel::Value => f.write_str("value"),
        }
    }
}

/// One recorded generator decision: the byte range it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// Offset of the first consumed byte.
    pub offset: u32,
    /// Number of consumed bytes, or [`Choice::BIT`] for boolean draws.
    pub length: i32,
}

impl Choice {
    /// Sentinel length of a boolean draw. Generators only consume the low
    /// bit of the underlying byte, so mutation must flip that bit rather
    /// than replace the byte.
    pub const BIT: i32 = -1;

    pub fn new(offset: u32, length: i32) -> Self {
        Self { offset, length }
    }

    pub fn is_bit(&self) -> bool {
        self.length == Self::BIT
    }

    /// Width of the underlying byte range (1 for boolean draws).
    pub fn len(&self) -> u32 {
        self.length.unsigned_abs()
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Offset one past the last consumed byte.
    pub fn end(&self) -> u32 {
        self.offset + self.len()
    }
}

/// Byte provider for one execution of an input.
///
/// Exposes the structural and value channels over the input's shared buffer:
/// reads replay previously recorded bytes and extend the frontier with fresh
/// random bytes once the recording is exhausted (or yield end-of-stream in
/// `eof_when_exhausted` mode). Each completed draw is logged in the input's
/// choice ledger.
pub struct SplitByteSource<'a> {
    input: &'a mut InputRecord,
    rng: &'a mut StdRng,
    max_input_size: u32,
    eof_when_exhausted: bool,
    /// Offset of the first byte of the in-flight draw.
    mark: u32,
}

impl<'a> SplitByteSource<'a> {
    pub(crate) fn new(input: &'a mut InputRecord, rng: &'a mut StdRng, cfg: &Config) -> Self {
        let mark = input.requested();
        Self {
            input,
            rng,
            max_input_size: cfg.max_input_size,
            eof_when_exhausted: cfg.eof_when_exhausted,
            mark,
        }
    }

    /// Total number of bytes consumed so far in this execution.
    pub fn total_requested(&self) -> u32 {
        self.input.requested()
    }

    fn next_raw(&mut self, channel: Channel) -> Result<Option<u8>> {
        let key = self.input.requested();
        self.input.get_or_generate(
            channel,
            key,
            self.rng,
            self.max_input_size,
            self.eof_when_exhausted,
        )
    }

    /// Appends a choice covering everything consumed since the last commit.
    /// A no-op when nothing was consumed (end-of-stream before the first
    /// byte of a draw).
    fn commit(&mut self, channel: Channel, length_override: Option<i32>) {
        let consumed = self.input.requested() - self.mark;
        if consumed == 0 {
            return;
        }
        let length = length_override.unwrap_or(consumed as i32);
        self.input.push_choice(channel, Choice::new(self.mark, length));
        self.mark = self.input.requested();
    }

    fn take_array<const N: usize>(&mut self, channel: Channel) -> Result<Option<[u8; N]>> {
        let mut out = [0u8; N];
        for slot in &mut out {
            match self.next_raw(channel)? {
                Some(b) => *slot = b,
                None => {
                    // Partially consumed draws still get ledger entries so
                    // the alignment check stays sound.
                    self.commit(channel, None);
                    return Ok(None);
                }
            }
        }
        Ok(Some(out))
    }

    /// Reads a single byte from the given channel. `None` means the
    /// configured end-of-stream or size cap was reached.
    pub fn read_next_byte(&mut self, channel: Channel) -> Result<Option<u8>> {
        self.next_u8(channel)
    }

    pub fn next_u8(&mut self, channel: Channel) -> Result<Option<u8>> {
        let Some([b]) = self.take_array::<1>(channel)? else {
            return Ok(None);
        };
        self.commit(channel, None);
        Ok(Some(b))
    }

    pub fn next_u16(&mut self, channel: Channel) -> Result<Option<u16>> {
        let Some(raw) = self.take_array::<2>(channel)? else {
            return Ok(None);
        };
        self.commit(channel, None);
        Ok(Some(u16::from_le_bytes(raw)))
    }

    pub fn next_u32(&mut self, channel: Channel) -> Result<Option<u32>> {
        let Some(raw) = self.take_array::<4>(channel)? else {
            return Ok(None);
        };
        self.commit(channel, None);
        Ok(Some(u32::from_le_bytes(raw)))
    }

    pub fn next_u64(&mut self, channel: Channel) -> Result<Option<u64>> {
        let Some(raw) = self.take_array::<8>(channel)? else {
            return Ok(None);
        };
        self.commit(channel, None);
        Ok(Some(u64::from_le_bytes(raw)))
    }

    pub fn next_f32(&mut self, channel: Channel) -> Result<Option<f32>> {
        Ok(self.next_u32(channel)?.map(f32::from_bits))
    }

    pub fn next_f64(&mut self, channel: Channel) -> Result<Option<f64>> {
        Ok(self.next_u64(channel)?.map(f64::from_bits))
    }

    /// Reads one byte but records a one-bit choice: only the low bit is
    /// semantically meaningful.
    pub fn next_bool(&mut self, channel: Channel) -> Result<Option<bool>> {
        let Some([b]) = self.take_array::<1>(channel)? else {
            return Ok(None);
        };
        self.commit(channel, Some(Choice::BIT));
        Ok(Some(b & 1 == 1))
    }

    /// Reads `len` bytes as a single choice.
    pub fn next_bytes(&mut self, channel: Channel, len: usize) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            match self.next_raw(channel)? {
                Some(b) => out.push(b),
                None => {
                    self.commit(channel, None);
                    return Ok(None);
                }
            }
        }
        self.commit(channel, None);
        Ok(Some(out))
    }

    /// Draws an index in `[0, n)`, as used for choose-from-set decisions.
    pub fn choose_index(&mut self, channel: Channel, n: usize) -> Result<Option<usize>> {
        debug_assert!(n > 0);
        Ok(self.next_u32(channel)?.map(|raw| raw as usize % n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn source_fixture<'a>(input: &'a mut InputRecord, rng: &'a mut StdRng) -> SplitByteSource<'a> {
        // Struct update through a local to keep lifetimes readable.
        SplitByteSource::new(input, rng, &Config::default())
    }

    fn source_fixture_cfg<'a>(
        input: &'a mut InputRecord,
        rng: &'a mut StdRng,
        cfg: &Config,
    ) -> SplitByteSource<'a> {
        SplitByteSource::new(input, rng, cfg)
    }

    #[test]
    fn draws_partition_the_consumed_prefix() {
        let mut input = InputRecord::fresh();
        let mut rng = StdRng::seed_from_u64(7);
        let mut src = source_fixture(&mut input, &mut rng);

        src.next_u32(Channel::Structure).unwrap().unwrap();
        src.next_bool(Channel::Structure).unwrap().unwrap();
        src.next_u16(Channel::Value).unwrap().unwrap();
        src.next_u8(Channel::Value).unwrap().unwrap();
        assert_eq!(src.total_requested(), 8);
        drop(src);

        assert_eq!(
            input.structure_choices(),
            &[Choice::new(0, 4), Choice::new(4, Choice::BIT)]
        );
        assert_eq!(
            input.value_choices(),
            &[Choice::new(5, 2), Choice::new(7, 1)]
        );
        input.validate_choices().unwrap();
    }

    #[test]
    fn replay_returns_recorded_bytes() {
        let mut input = InputRecord::from_seed(vec![0xAA, 0xBB, 0xCC]);
        let mut rng = StdRng::seed_from_u64(0);
        let mut src = source_fixture(&mut input, &mut rng);
        assert_eq!(src.next_u8(Channel::Value).unwrap(), Some(0xAA));
        assert_eq!(src.next_u8(Channel::Value).unwrap(), Some(0xBB));
        assert_eq!(src.next_u8(Channel::Value).unwrap(), Some(0xCC));
        // Past the recording: a synthesized byte extends the buffer.
        assert!(src.next_u8(Channel::Value).unwrap().is_some());
        assert_eq!(src.total_requested(), 4);
    }

    #[test]
    fn eof_mode_ends_stream_instead_of_synthesizing() {
        let cfg = Config {
            eof_when_exhausted: true,
            ..Config::default()
        };
        let mut input = InputRecord::from_seed(vec![1, 2]);
        let mut rng = StdRng::seed_from_u64(0);
        let mut src = source_fixture_cfg(&mut input, &mut rng, &cfg);
        assert!(src.next_u8(Channel::Value).unwrap().is_some());
        assert!(src.next_u8(Channel::Value).unwrap().is_some());
        assert_eq!(src.next_u8(Channel::Value).unwrap(), None);
    }

    #[test]
    fn max_input_size_caps_growth() {
        let cfg = Config {
            max_input_size: 3,
            ..Config::default()
        };
        let mut input = InputRecord::fresh();
        let mut rng = StdRng::seed_from_u64(1);
        let mut src = source_fixture_cfg(&mut input, &mut rng, &cfg);
        assert!(src.next_u16(Channel::Structure).unwrap().is_some());
        // Second u16 draw hits the cap after one byte; the partial byte is
        // still ledgered so alignment holds.
        assert_eq!(src.next_u16(Channel::Structure).unwrap(), None);
        assert_eq!(src.total_requested(), 3);
        drop(src);
        input.validate_choices().unwrap();
    }

    #[test]
    fn mixed_channel_sequence_terminated_by_value_channel_aligns() {
        let mut input = InputRecord::fresh();
        let mut rng = StdRng::seed_from_u64(3);
        let mut src = source_fixture(&mut input, &mut rng);
        src.next_bool(Channel::Structure).unwrap().unwrap();
        src.next_u64(Channel::Value).unwrap().unwrap();
        drop(src);
        input.validate_choices().unwrap();
    }
}
