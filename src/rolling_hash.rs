/// Adler32-style rolling checksum over a fixed-size window.
///
/// Two sums modulo 65521 packed into 32 bits; sliding the window by one byte
/// is O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingChecksum {
    /// Checksum of an initial window.
    pub fn over(block: &[u8]) -> Self {
        // Sums are kept in u64 and reduced once at the end.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in block {
            a += u64::from(byte);
            b += a;
        }
        Self {
            a: (a % u64::from(MOD_ADLER)) as u32,
            b: (b % u64::from(MOD_ADLER)) as u32,
            window: block.len() as u32,
        }
    }

    /// Slide the window: drop `out` from the front, append `incoming`.
    pub fn roll(&mut self, out: u8, incoming: u8) {
        let out = u32::from(out);
        let incoming = u32::from(incoming);
        let weighted_out = (out * (self.window % MOD_ADLER)) % MOD_ADLER;

        self.a = (self.a + MOD_ADLER - out + incoming) % MOD_ADLER;
        self.b = (self.b + 2 * MOD_ADLER - 1 + self.a - weighted_out) % MOD_ADLER;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
