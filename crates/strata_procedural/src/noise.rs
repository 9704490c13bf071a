//! # Simplex Noise
//!
//! Deterministic 2D simplex noise and its fractal sums.
//!
//! ## Determinism Guarantee
//!
//! Given the same [`WorldSeed`], every function here returns bit-identical
//! values on any platform and from any thread. Noise tables are immutable
//! after construction, so one instance can be shared by all workers.

/// World seed for deterministic generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorldSeed(u64);

impl WorldSeed {
    /// Creates a new world seed.
    #[inline]
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Returns the raw seed value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Derives an independent sub-seed for one noise channel.
    #[inline]
    #[must_use]
    pub const fn derive(self, channel: u64) -> Self {
        let mut hash = self.0 ^ channel.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        hash = hash.wrapping_mul(0x517C_C1B7_2722_0A95);
        hash ^= hash >> 32;
        Self(hash)
    }
}

impl Default for WorldSeed {
    fn default() -> Self {
        Self(0x5EED_0F_57_2A7A)
    }
}

/// Parameters of a fractal noise sum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Octaves {
    /// Number of layers.
    pub count: u32,
    /// Amplitude multiplier per layer.
    pub persistence: f64,
    /// Frequency multiplier per layer.
    pub lacunarity: f64,
}

impl Octaves {
    /// Broad, smooth shapes.
    pub const SMOOTH: Self = Self::new(3, 0.5, 2.0);
    /// General terrain detail.
    pub const TERRAIN: Self = Self::new(5, 0.5, 2.0);

    /// Creates a new octave description.
    #[must_use]
    pub const fn new(count: u32, persistence: f64, lacunarity: f64) -> Self {
        Self {
            count,
            persistence,
            lacunarity,
        }
    }
}

/// 12 gradient directions for 2D simplex.
const GRADIENTS: [[f64; 2]; 12] = [
    [1.0, 0.0],
    [1.0, 1.0],
    [0.0, 1.0],
    [-1.0, 1.0],
    [-1.0, 0.0],
    [-1.0, -1.0],
    [0.0, -1.0],
    [1.0, -1.0],
    [1.0, 0.0],
    [0.0, 1.0],
    [-1.0, 0.0],
    [0.0, -1.0],
];

/// Skew factor, (sqrt(3) - 1) / 2.
const F2: f64 = 0.366_025_403_784_438_6;
/// Unskew factor, (3 - sqrt(3)) / 6.
const G2: f64 = 0.211_324_865_405_187_1;

/// 2D simplex noise generator.
///
/// `sample` returns values in `[-1, 1]`.
///
/// # Example
///
/// ```rust,ignore
/// let noise = SimplexNoise::new(WorldSeed::new(42));
/// let detail = noise.fbm(x * 0.01, z * 0.01, Octaves::TERRAIN);
/// ```
#[derive(Clone)]
pub struct SimplexNoise {
    /// Shuffled 0..=255, doubled so lookups never wrap.
    perm: [u8; 512],
}

impl SimplexNoise {
    /// Creates a new noise generator from a seed.
    #[must_use]
    pub fn new(seed: WorldSeed) -> Self {
        let mut table = [0_u8; 256];
        for (slot, value) in table.iter_mut().zip(0_u8..=255) {
            *slot = value;
        }

        // Fisher-Yates driven by xorshift64
        let mut state = seed.value() | 1;
        for i in (1..256_usize).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = usize::try_from(state % (i as u64 + 1)).unwrap_or(0);
            table.swap(i, j);
        }

        let mut perm = [0_u8; 512];
        perm[..256].copy_from_slice(&table);
        perm[256..].copy_from_slice(&table);
        Self { perm }
    }

    #[inline]
    fn hash(&self, index: usize) -> usize {
        usize::from(self.perm[index & 511])
    }

    #[inline]
    fn corner(&self, x: f64, y: f64, hash: usize) -> f64 {
        let t = 0.5 - x * x - y * y;
        if t < 0.0 {
            return 0.0;
        }
        let [gx, gy] = GRADIENTS[hash % 12];
        let t2 = t * t;
        t2 * t2 * (gx * x + gy * y)
    }

    /// Samples noise at `(x, y)`. Returns a value in `[-1, 1]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn sample(&self, x: f64, y: f64) -> f64 {
        let skew = (x + y) * F2;
        let i = (x + skew).floor();
        let j = (y + skew).floor();

        let unskew = (i + j) * G2;
        let x0 = x - (i - unskew);
        let y0 = y - (j - unskew);

        let (i1, j1) = if x0 > y0 { (1, 0) } else { (0, 1) };
        let x1 = x0 - f64::from(i1) + G2;
        let y1 = y0 - f64::from(j1) + G2;
        let x2 = x0 - 1.0 + 2.0 * G2;
        let y2 = y0 - 1.0 + 2.0 * G2;

        // Wrap lattice coordinates into the table
        let ii = (i as i64).rem_euclid(256) as usize;
        let jj = (j as i64).rem_euclid(256) as usize;
        let (i1, j1) = (i1 as usize, j1 as usize);

        let h0 = self.hash(ii + self.hash(jj));
        let h1 = self.hash(ii + i1 + self.hash(jj + j1));
        let h2 = self.hash(ii + 1 + self.hash(jj + 1));

        let total = self.corner(x0, y0, h0) + self.corner(x1, y1, h1) + self.corner(x2, y2, h2);
        (70.0 * total).clamp(-1.0, 1.0)
    }

    /// Fractal Brownian motion: a normalized sum of `octaves` layers.
    #[must_use]
    pub fn fbm(&self, x: f64, y: f64, octaves: Octaves) -> f64 {
        self.layered(x, y, octaves, |n| n)
    }

    /// Ridged fractal noise in `[0, 1]`, peaking along zero crossings.
    ///
    /// Thin ridges trace river valleys when inverted.
    #[must_use]
    pub fn ridged(&self, x: f64, y: f64, octaves: Octaves) -> f64 {
        self.layered(x, y, octaves, |n| {
            let ridge = 1.0 - n.abs();
            ridge * ridge
        })
    }

    fn layered(&self, x: f64, y: f64, octaves: Octaves, shape: impl Fn(f64) -> f64) -> f64 {
        let mut total = 0.0;
        let mut amplitude = 1.0;
        let mut frequency = 1.0;
        let mut norm = 0.0;

        for _ in 0..octaves.count.max(1) {
            total += shape(self.sample(x * frequency, y * frequency)) * amplitude;
            norm += amplitude;
            amplitude *= octaves.persistence;
            frequency *= octaves.lacunarity;
        }

        total / norm
    }
}
