//! Overwrite patterns for the wipe algorithms.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use sysenc_core::{SysencError, SysencResult, WipeAlgorithm};

/// Fixed Gutmann passes 5..=31, each a repeating 1- or 3-byte pattern.
const GUTMANN_PATTERNS: [&[u8]; 27] = [
    &[0x55],
    &[0xAA],
    &[0x92, 0x49, 0x24],
    &[0x49, 0x24, 0x92],
    &[0x24, 0x92, 0x49],
    &[0x00],
    &[0x11],
    &[0x22],
    &[0x33],
    &[0x44],
    &[0x55],
    &[0x66],
    &[0x77],
    &[0x88],
    &[0x99],
    &[0xAA],
    &[0xBB],
    &[0xCC],
    &[0xDD],
    &[0xEE],
    &[0xFF],
    &[0x92, 0x49, 0x24],
    &[0x49, 0x24, 0x92],
    &[0x24, 0x92, 0x49],
    &[0x6D, 0xB6, 0xDB],
    &[0xB6, 0xDB, 0x6D],
    &[0xDB, 0x6D, 0xB6],
];

const GUTMANN_RANDOM_PASSES: usize = 4;

/// What a single pass writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Random,
    Pattern(&'static [u8]),
    Byte(u8),
}

/// Produces the buffer contents of each pass. The DoD 7-pass characters
/// are drawn once per wipe so every sector sees the same sequence.
pub struct Wiper {
    algorithm: WipeAlgorithm,
    chars: [u8; 3],
    rng: StdRng,
}

impl Wiper {
    pub fn new(algorithm: WipeAlgorithm) -> Self {
        let mut rng = StdRng::from_entropy();
        let chars = rng.gen();
        Self {
            algorithm,
            chars,
            rng,
        }
    }

    pub fn algorithm(&self) -> WipeAlgorithm {
        self.algorithm
    }

    pub fn passes(&self) -> usize {
        self.algorithm.pass_count()
    }

    fn pass(&self, pass: usize) -> SysencResult<Pass> {
        if pass >= self.passes() {
            return Err(SysencError::InvalidState(format!(
                "{} has {} passes, asked for pass {pass}",
                self.algorithm,
                self.passes()
            )));
        }
        let [r0, r1, r2] = self.chars;
        Ok(match self.algorithm {
            WipeAlgorithm::None | WipeAlgorithm::Random1 => Pass::Random,
            WipeAlgorithm::Dod3 => match pass {
                0 => Pass::Byte(0x00),
                1 => Pass::Byte(0xFF),
                _ => Pass::Random,
            },
            WipeAlgorithm::Dod7 => match pass {
                0 => Pass::Byte(r0),
                1 => Pass::Byte(!r0),
                3 => Pass::Byte(r1),
                4 => Pass::Byte(r2),
                5 => Pass::Byte(!r2),
                _ => Pass::Random,
            },
            WipeAlgorithm::Gutmann => {
                let fixed = pass.checked_sub(GUTMANN_RANDOM_PASSES);
                match fixed.and_then(|i| GUTMANN_PATTERNS.get(i)) {
                    Some(pattern) => Pass::Pattern(pattern),
                    None => Pass::Random,
                }
            }
        })
    }

    /// Fill `buf` with the data for `pass` (0-based). Patterns restart at
    /// the beginning of every buffer, so callers pass sector-aligned chunks.
    pub fn fill(&mut self, pass: usize, buf: &mut [u8]) -> SysencResult<()> {
        match self.pass(pass)? {
            Pass::Random => self.rng.fill_bytes(buf),
            Pass::Byte(b) => buf.fill(b),
            Pass::Pattern(pattern) => {
                for (dst, src) in buf.iter_mut().zip(pattern.iter().cycle()) {
                    *dst = *src;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gutmann_layout() {
        let mut wiper = Wiper::new(WipeAlgorithm::Gutmann);
        assert_eq!(wiper.passes(), 35);
        assert_eq!(GUTMANN_RANDOM_PASSES * 2 + GUTMANN_PATTERNS.len(), 35);

        let mut buf = [0u8; 512];
        wiper.fill(4, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x55));

        wiper.fill(6, &mut buf).unwrap();
        assert_eq!(&buf[..6], &[0x92, 0x49, 0x24, 0x92, 0x49, 0x24]);

        wiper.fill(24, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));

        wiper.fill(30, &mut buf).unwrap();
        assert_eq!(&buf[..3], &[0xDB, 0x6D, 0xB6]);
    }

    #[test]
    fn dod7_complements_its_characters() {
        let mut wiper = Wiper::new(WipeAlgorithm::Dod7);
        let mut first = [0u8; 512];
        let mut second = [0u8; 512];
        wiper.fill(0, &mut first).unwrap();
        wiper.fill(1, &mut second).unwrap();
        assert!(first.iter().zip(&second).all(|(a, b)| *a == !*b));

        let mut again = [0u8; 512];
        wiper.fill(0, &mut again).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn dod3_fixed_passes() {
        let mut wiper = Wiper::new(WipeAlgorithm::Dod3);
        let mut buf = [0xAAu8; 512];
        wiper.fill(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        wiper.fill(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
        wiper.fill(2, &mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0xFF));
    }

    #[test]
    fn pass_out_of_range() {
        let mut wiper = Wiper::new(WipeAlgorithm::Random1);
        let mut buf = [0u8; 512];
        assert!(wiper.fill(0, &mut buf).is_ok());
        assert!(matches!(
            wiper.fill(1, &mut buf),
            Err(SysencError::InvalidState(_))
        ));
        assert_eq!(Wiper::new(WipeAlgorithm::None).passes(), 0);
    }
}
