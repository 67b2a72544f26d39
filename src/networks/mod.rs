//! Generator and discriminator networks.

mod discriminator;
mod generator;

pub use discriminator::GpPatchMcResDis;
pub use generator::{ClassModelEncoder, ContentEncoder, Decoder, FewShotGen, Mlp};

/// Hands out well-separated layer seeds so no two blocks share weights.
///
/// Blocks derive a handful of seeds from the one they receive (`seed + i`),
/// so consecutive seeds are spaced apart.
struct Seeds(u64);

impl Seeds {
    const STRIDE: u64 = 1 << 10;

    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x2545_F491_4F6C_DD1D))
    }

    fn next(&mut self) -> u64 {
        let s = self.0;
        self.0 = self.0.wrapping_add(Self::STRIDE);
        s
    }
}
