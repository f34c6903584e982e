// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scan images: chain-indexed bit vectors packed into 32-bit words.
//!
//! The *initial* image holds every variable's reset value (recorded by
//! reset extraction) and is shifted into the chain before the DUT is
//! unfrozen — that is how reset semantics survive the stripping of the
//! reset tree. Variables whose reset value comes from a reset-time DPI
//! call are patched with the call's return value at first reset
//! release.

use emu_proto::scanmap::ScanMap;

/// A chain image: bit `i` of the chain is bit `i % 32` of word
/// `i / 32`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanImage {
    words: Vec<u32>,
    len_bits: u32,
}

impl ScanImage {
    pub fn new(len_bits: u32) -> Self {
        ScanImage {
            words: vec![0; len_bits.div_ceil(32) as usize],
            len_bits,
        }
    }

    /// Build the initial image from the scan map's reset values.
    pub fn from_reset_values(map: &ScanMap) -> Self {
        let mut image = ScanImage::new(map.chain_length);
        for var in &map.variables {
            if let Some(words) = &var.reset_value {
                image.patch_words(var.offset, var.width, words);
            }
        }
        image
    }

    pub fn from_words(words: Vec<u32>, len_bits: u32) -> Self {
        debug_assert_eq!(words.len() as u32, len_bits.div_ceil(32));
        ScanImage { words, len_bits }
    }

    pub fn len_bits(&self) -> u32 {
        self.len_bits
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn set_bit(&mut self, index: u32, value: bool) {
        let word = (index / 32) as usize;
        let bit = index % 32;
        if value {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }

    fn bit(&self, index: u32) -> bool {
        self.words[(index / 32) as usize] >> (index % 32) & 1 != 0
    }

    /// Overwrite a variable's bits, little-endian, truncated to
    /// `width`.
    pub fn patch(&mut self, offset: u32, width: u32, value: u64) {
        for i in 0..width.min(self.len_bits.saturating_sub(offset)) {
            let bit = if i < 64 { value >> i & 1 != 0 } else { false };
            self.set_bit(offset + i, bit);
        }
    }

    pub fn patch_words(&mut self, offset: u32, width: u32, words: &[u32]) {
        for i in 0..width.min(self.len_bits.saturating_sub(offset)) {
            let word = (i / 32) as usize;
            let value = words.get(word).copied().unwrap_or(0) >> (i % 32) & 1 != 0;
            self.set_bit(offset + i, value);
        }
    }

    /// Read a variable back out (up to 64 bits).
    pub fn extract(&self, offset: u32, width: u32) -> u64 {
        let mut value = 0u64;
        for i in 0..width.min(64).min(self.len_bits.saturating_sub(offset)) {
            if self.bit(offset + i) {
                value |= 1 << i;
            }
        }
        value
    }
}

/// Convert an image to the shift stream: the stream is the image in
/// reverse chain order, because the first bit shifted in travels to the
/// end of the chain.
pub fn image_to_stream(image: &[u32], len_bits: u32) -> Vec<u32> {
    reverse_bits(image, len_bits)
}

/// Convert a captured shift stream back to an image: the first bit out
/// of the chain is the highest chain position.
pub fn stream_to_image(stream: &[u32], len_bits: u32) -> Vec<u32> {
    reverse_bits(stream, len_bits)
}

fn reverse_bits(words: &[u32], len_bits: u32) -> Vec<u32> {
    let mut out = vec![0u32; len_bits.div_ceil(32) as usize];
    for i in 0..len_bits {
        let j = len_bits - 1 - i;
        let set = words.get((i / 32) as usize).copied().unwrap_or(0) >> (i % 32) & 1 != 0;
        if set {
            out[(j / 32) as usize] |= 1 << (j % 32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_proto::scanmap::ScanVariable;

    #[test]
    fn counter_reset_image() {
        // One 8-bit variable with reset value 0x42: word 0 of the
        // initial image is 0x00000042.
        let map = ScanMap {
            chain_length: 8,
            variables: vec![ScanVariable {
                name: "dut.q".to_string(),
                width: 8,
                offset: 0,
                reset_value: Some(vec![0x42]),
                reset_dpi_func: None,
                enum_members: Vec::new(),
            }],
        };
        let image = ScanImage::from_reset_values(&map);
        assert_eq!(image.words(), &[0x42]);
        assert_eq!(image.extract(0, 8), 0x42);
    }

    #[test]
    fn patch_is_width_truncated_little_endian() {
        let mut image = ScanImage::new(40);
        image.patch(4, 8, 0xFFFF); // only 8 bits land
        assert_eq!(image.extract(4, 8), 0xFF);
        assert_eq!(image.extract(0, 4), 0);
        assert_eq!(image.extract(12, 8), 0);

        image.patch(32, 8, 0xA5);
        assert_eq!(image.words()[1], 0xA5);
    }

    #[test]
    fn stream_round_trip() {
        let image = vec![0xdead_beef, 0x0000_0012];
        let len = 37;
        let stream = image_to_stream(&image, len);
        assert_eq!(stream_to_image(&stream, len), image);
    }

    #[test]
    fn stream_is_bit_reversed() {
        // 3-bit chain, image 0b011: stream must be 0b110.
        let stream = image_to_stream(&[0b011], 3);
        assert_eq!(stream, vec![0b110]);
    }

    #[test]
    fn multi_variable_image() {
        let map = ScanMap {
            chain_length: 11,
            variables: vec![
                ScanVariable {
                    name: "a".to_string(),
                    width: 3,
                    offset: 0,
                    reset_value: Some(vec![0b101]),
                    reset_dpi_func: None,
                    enum_members: Vec::new(),
                },
                ScanVariable {
                    name: "b".to_string(),
                    width: 8,
                    offset: 3,
                    reset_value: Some(vec![0x42]),
                    reset_dpi_func: None,
                    enum_members: Vec::new(),
                },
            ],
        };
        let image = ScanImage::from_reset_values(&map);
        assert_eq!(image.extract(0, 3), 0b101);
        assert_eq!(image.extract(3, 8), 0x42);
        assert_eq!(image.words(), &[0b101 | (0x42 << 3)]);
    }
}
