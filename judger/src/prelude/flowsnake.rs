use std::{
    cell::RefCell,
    fmt::{Debug, Formatter},
};

/// A roughly time-ordered 64-bit identifier, rendered as 13 Crockford-style
/// base32 characters. Used to name per-run working areas and containers.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct FlowSnake(pub u64);

thread_local! {
    static LAST_GENERATION_TIME: RefCell<u64> = RefCell::new(0);
    static SEQ_NUMBER: RefCell<u64> = RefCell::new(0);
    static LOC_WORKER_ID: u64 = rand::random::<u64>();
}

pub const TIMESTAMP_BITS: u32 = 34;
pub const WORKER_ID_BITS: u32 = 12;
pub const SEQUENCE_BITS: u32 = 18;

const BASE32_TO_CHAR: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

const CHAR_TO_BASE32: [u8; 128] = [
    255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
    255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
    255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 255, 255, 255,
    255, 255, 255, 255, 10, 11, 12, 13, 14, 15, 16, 17, 255, 18, 19, 255, 20, 21, 255, 22, 23, 24,
    25, 26, 255, 27, 28, 29, 30, 31, 255, 255, 255, 255, 255, 255, 10, 11, 12, 13, 14, 15, 16, 17,
    255, 18, 19, 255, 20, 21, 255, 22, 23, 24, 25, 26, 255, 27, 28, 29, 30, 31, 255, 255, 255, 255,
    255,
];

impl FlowSnake {
    pub fn new_parts(timestamp: u64, worker_id: u64, seq: u64) -> FlowSnake {
        let n = ((timestamp & ((1 << TIMESTAMP_BITS) - 1)) << (WORKER_ID_BITS + SEQUENCE_BITS))
            | ((worker_id & ((1 << WORKER_ID_BITS) - 1)) << SEQUENCE_BITS)
            | (seq & ((1 << SEQUENCE_BITS) - 1));
        FlowSnake(n)
    }

    pub fn generate() -> FlowSnake {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let worker_id = LOC_WORKER_ID.with(|x| *x);
        let seq = if LAST_GENERATION_TIME.with(|x| time <= *x.borrow()) {
            SEQ_NUMBER.with(|s| {
                let mut s = s.borrow_mut();
                let seq = *s;
                *s += 1;
                seq
            })
        } else {
            LAST_GENERATION_TIME.with(|t| *(t.borrow_mut()) = time);
            let rnd = rand::random::<u64>() % ((1 << SEQUENCE_BITS) - (1 << (SEQUENCE_BITS - 2)));
            SEQ_NUMBER.with(|s| {
                (*s.borrow_mut()) = rnd + 1;
            });
            rnd
        };

        FlowSnake::new_parts(time, worker_id, seq)
    }

    /// Parse the 13-character textual form. Returns `None` for anything else,
    /// which lets directory sweeps skip entries this crate did not create.
    pub fn parse(s: &str) -> Option<FlowSnake> {
        if s.len() != 13 {
            return None;
        }
        let mut n = 0u64;
        for ch in s.chars() {
            let ch = ch as usize;
            if ch >= CHAR_TO_BASE32.len() {
                return None;
            }
            let five_bit = CHAR_TO_BASE32[ch] as u64;
            if five_bit == 255 {
                return None;
            }
            n <<= 5;
            n |= five_bit;
        }
        Some(FlowSnake(n))
    }

    fn write_str_buffered(&self, buf: &mut [u8; 13]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            let x = ((self.0 >> (5 * (12 - i))) & 0x1f) as usize;
            *slot = BASE32_TO_CHAR[x];
        }
    }
}

impl std::fmt::Display for FlowSnake {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = [0u8; 13];
        self.write_str_buffered(&mut s);
        // every byte comes from the ASCII alphabet above
        f.write_str(std::str::from_utf8(&s).map_err(|_| std::fmt::Error)?)
    }
}

impl Debug for FlowSnake {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
