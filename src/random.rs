use rand::RngCore;

#[cfg_attr(test, mockall::automock)]
pub trait RandomSource: Send {
    fn next_u64(&mut self) -> u64;
}

pub struct ThreadRngRandom {}
impl RandomSource for ThreadRngRandom {
    fn next_u64(&mut self) -> u64 {
        rand::thread_rng().next_u64()
    }
}

/// Generates session numbers and initial serial numbers.
///
/// Session numbers have the following layout (64 bit):
/// ```ascii
/// 63..56  engine index
/// 55      always 0
/// 54..16  random
/// 15..0   incrementing counter, skipping 0
/// ```
///
/// With `force_32_bit`, session numbers are `engine index (31..24) | random (22..16) | counter (15..0)`
///  for peers that can not handle bigger numbers.
///
/// Serial numbers are random with the highest bit and the low 16 bits cleared before setting
///  bit 0, leaving room for incrementing them during a session without wrap-around.
pub struct LtpRandomNumberGenerator {
    random: Box<dyn RandomSource>,
    engine_index: u8,
    force_32_bit: bool,
    counter: u16,
}

impl LtpRandomNumberGenerator {
    pub fn new(engine_index: u8, force_32_bit: bool) -> LtpRandomNumberGenerator {
        LtpRandomNumberGenerator::with_source(Box::new(ThreadRngRandom {}), engine_index, force_32_bit)
    }

    pub fn with_source(random: Box<dyn RandomSource>, engine_index: u8, force_32_bit: bool) -> LtpRandomNumberGenerator {
        LtpRandomNumberGenerator {
            random,
            engine_index,
            force_32_bit,
            counter: 0,
        }
    }

    fn next_counter(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            self.counter = 1;
        }
        self.counter as u64
    }

    pub fn next_session_number(&mut self) -> u64 {
        let random = self.random.next_u64();
        let counter = self.next_counter();
        if self.force_32_bit {
            ((self.engine_index as u64) << 24) | (random & 0x007f_0000) | counter
        }
        else {
            ((self.engine_index as u64) << 56) | (random & 0x007f_ffff_ffff_0000) | counter
        }
    }

    /// generates session numbers until one is found that is not in use
    pub fn next_unused_session_number(&mut self, is_in_use: impl Fn(u64) -> bool) -> u64 {
        loop {
            let candidate = self.next_session_number();
            if !is_in_use(candidate) {
                return candidate;
            }
        }
    }

    pub fn next_serial_number(&mut self) -> u64 {
        let random = self.random.next_u64();
        if self.force_32_bit {
            (random & 0x7fff_0000) | 1
        }
        else {
            (random & 0x7fff_ffff_ffff_0000) | 1
        }
    }
}
