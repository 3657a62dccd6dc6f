use std::mem;
use std::ops::Range;

use crate::contract::{BufferInfo, Codec, TranscodeError};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
/// Bytes of the first keyframe inspected by the leading-NAL heuristic.
const LEADING_NAL_SCAN_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nalus: Vec<Vec<u8>>,
    pub codec: Codec,
    pub is_keyframe: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSetCache {
    h264_sps: Option<Vec<u8>>,
    h264_pps: Option<Vec<u8>>,
    hevc_vps: Option<Vec<u8>>,
    hevc_sps: Option<Vec<u8>>,
    hevc_pps: Option<Vec<u8>>,
}

/// Splits a chunked Annex-B stream into access units, remembering the most
/// recent parameter sets on the way.
#[derive(Debug, Default)]
pub struct StatefulBitstreamAssembler {
    codec: Option<Codec>,
    pending: Vec<u8>,
    saw_aud: bool,
    current_nalus: Vec<Vec<u8>>,
    current_has_vcl: bool,
    current_has_key_vcl: bool,
    parameter_sets: ParameterSetCache,
}

impl StatefulBitstreamAssembler {
    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec: Some(codec),
            ..Self::default()
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8], codec: Codec) -> Vec<AccessUnit> {
        self.codec = Some(codec);
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        let nalus = self.take_complete_nals(false);
        self.process_nals(codec, nalus)
    }

    pub fn flush(&mut self) -> Result<Vec<AccessUnit>, TranscodeError> {
        let codec = self
            .codec
            .ok_or_else(|| TranscodeError::Source("bitstream codec is not set".to_string()))?;
        let nalus = self.take_complete_nals(true);
        let mut access_units = self.process_nals(codec, nalus);
        if self.current_has_vcl && !self.current_nalus.is_empty() {
            access_units.push(self.finish_current_access_unit(codec));
        }

        Ok(access_units)
    }

    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.parameter_sets
    }

    fn process_nals(&mut self, codec: Codec, nalus: Vec<Vec<u8>>) -> Vec<AccessUnit> {
        let mut out = Vec::new();

        for nal in nalus {
            self.parameter_sets.observe(codec, &nal);

            if is_aud(codec, &nal) {
                self.saw_aud = true;
                if self.current_has_vcl && !self.current_nalus.is_empty() {
                    out.push(self.finish_current_access_unit(codec));
                } else {
                    self.current_nalus.clear();
                    self.current_has_vcl = false;
                    self.current_has_key_vcl = false;
                }
                continue;
            }

            let nal_is_vcl = is_vcl(codec, &nal);
            if !self.saw_aud && nal_is_vcl && self.current_has_vcl && !self.current_nalus.is_empty()
            {
                out.push(self.finish_current_access_unit(codec));
            }

            let nal_is_key = is_key_vcl(codec, &nal);
            self.current_nalus.push(nal);
            if nal_is_vcl {
                self.current_has_vcl = true;
                self.current_has_key_vcl = self.current_has_key_vcl || nal_is_key;
            }
        }

        out
    }

    fn finish_current_access_unit(&mut self, codec: Codec) -> AccessUnit {
        let au = AccessUnit {
            nalus: mem::take(&mut self.current_nalus),
            codec,
            is_keyframe: self.current_has_key_vcl,
        };
        self.current_has_vcl = false;
        self.current_has_key_vcl = false;
        au
    }

    fn take_complete_nals(&mut self, finalize: bool) -> Vec<Vec<u8>> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let mut start_codes = find_start_codes(&self.pending);
        if start_codes.is_empty() {
            if finalize {
                self.pending.clear();
            }
            return Vec::new();
        }

        if start_codes[0].0 > 0 {
            self.pending.drain(..start_codes[0].0);
            start_codes = find_start_codes(&self.pending);
        }

        let mut nalus = Vec::new();
        for window in start_codes.windows(2) {
            let (start, start_len) = window[0];
            let end = window[1].0;
            let payload_start = start + start_len;
            if end > payload_start {
                nalus.push(self.pending[payload_start..end].to_vec());
            }
        }

        if finalize {
            if let Some((start, start_len)) = start_codes.last().copied() {
                let payload_start = start + start_len;
                if self.pending.len() > payload_start {
                    nalus.push(self.pending[payload_start..].to_vec());
                }
            }
            self.pending.clear();
        } else if let Some((start, _)) = start_codes.last().copied() {
            self.pending.drain(..start);
        }

        nalus
    }
}

impl ParameterSetCache {
    pub fn required_for_codec(&self, codec: Codec) -> Option<Vec<Vec<u8>>> {
        match codec {
            Codec::H264 => Some(vec![self.h264_sps.clone()?, self.h264_pps.clone()?]),
            Codec::Hevc => Some(vec![
                self.hevc_vps.clone()?,
                self.hevc_sps.clone()?,
                self.hevc_pps.clone()?,
            ]),
        }
    }

    fn observe(&mut self, codec: Codec, nal: &[u8]) {
        let Some(&header) = nal.first() else {
            return;
        };

        match codec {
            Codec::H264 => match header & 0x1f {
                7 => self.h264_sps = Some(nal.to_vec()),
                8 => self.h264_pps = Some(nal.to_vec()),
                _ => {}
            },
            Codec::Hevc => match (header >> 1) & 0x3f {
                32 => self.hevc_vps = Some(nal.to_vec()),
                33 => self.hevc_sps = Some(nal.to_vec()),
                34 => self.hevc_pps = Some(nal.to_vec()),
                _ => {}
            },
        }
    }
}

/// Positions and lengths of every 3- or 4-byte start code.
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i..].starts_with(&START_CODE) {
            out.push((i, 4));
            i += 4;
            continue;
        }
        if data[i..].starts_with(&[0, 0, 1]) {
            out.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}

/// Positions of every non-overlapping `00 00 00 01`.
pub fn find_four_byte_start_codes(data: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + START_CODE.len() <= data.len() {
        if data[i..i + START_CODE.len()] == START_CODE {
            out.push(i);
            i += START_CODE.len();
        } else {
            i += 1;
        }
    }
    out
}

/// Rewrites Annex-B start codes in place so that each one holds the
/// big-endian length of the NAL unit that follows it. Bytes before the first
/// start code are left untouched.
///
/// A start code in the last four bytes becomes an empty unit with length
/// zero. It is deliberately not folded into the previous unit, so the
/// sample keeps parsing as length-prefixed.
pub fn rewrite_annexb_to_length_prefixed(buf: &mut [u8]) {
    let starts = find_four_byte_start_codes(buf);
    for (i, &start) in starts.iter().enumerate() {
        let nal_end = starts.get(i + 1).copied().unwrap_or(buf.len());
        let nal_len = nal_end - (start + START_CODE.len());
        let len = u32::try_from(nal_len).unwrap_or(u32::MAX);
        buf[start..start + START_CODE.len()].copy_from_slice(&len.to_be_bytes());
    }
}

/// Payload ranges of a length-prefixed sample. Zero-length units are kept.
pub fn length_prefixed_nal_ranges(sample: &[u8]) -> Result<Vec<Range<usize>>, TranscodeError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < sample.len() {
        let Some(prefix) = sample.get(pos..pos + 4) else {
            return Err(TranscodeError::Mux(
                "truncated length prefix in sample".to_string(),
            ));
        };
        let nal_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let start = pos + 4;
        let end = start
            .checked_add(nal_len)
            .filter(|end| *end <= sample.len())
            .ok_or_else(|| {
                TranscodeError::Mux(format!(
                    "length prefix {nal_len} at offset {pos} exceeds sample of {} bytes",
                    sample.len()
                ))
            })?;
        out.push(start..end);
        pos = end;
    }
    Ok(out)
}

pub fn length_prefixed_to_annexb(sample: &[u8]) -> Result<Vec<u8>, TranscodeError> {
    let ranges = length_prefixed_nal_ranges(sample)?;
    let mut out = Vec::with_capacity(sample.len());
    for range in ranges.into_iter().filter(|range| !range.is_empty()) {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&sample[range]);
    }
    Ok(out)
}

/// Splits an encoder codec-config buffer at the last start code: everything
/// before it is the SPS, the rest the PPS. `None` when no boundary past the
/// first bytes exists.
pub fn split_parameter_sets(csd: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    (4..csd.len())
        .rev()
        .find(|&a| csd[a - 3..=a] == START_CODE)
        .map(|a| (csd[..a - 3].to_vec(), csd[a - 3..].to_vec()))
}

/// Offset of the second start code in the first bytes of an oversized
/// keyframe, i.e. how much to drop to skip a spurious leading NAL unit.
pub fn spurious_leading_nal_len(payload: &[u8]) -> Option<usize> {
    if payload.len() <= LEADING_NAL_SCAN_WINDOW {
        return None;
    }
    let window = &payload[..LEADING_NAL_SCAN_WINDOW];
    (0..LEADING_NAL_SCAN_WINDOW - START_CODE.len())
        .filter(|&a| window[a..a + START_CODE.len()] == START_CODE)
        .nth(1)
}

/// Advances `info` past `len` leading bytes without under-running it.
pub fn skip_leading_bytes(info: &mut BufferInfo, len: usize) {
    let len = len.min(info.size);
    info.offset += len;
    info.size -= len;
}

fn is_aud(codec: Codec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    match codec {
        Codec::H264 => (header & 0x1f) == 9,
        Codec::Hevc => ((header >> 1) & 0x3f) == 35,
    }
}

fn is_vcl(codec: Codec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    match codec {
        Codec::H264 => matches!(header & 0x1f, 1..=5 | 19),
        Codec::Hevc => ((header >> 1) & 0x3f) <= 31,
    }
}

fn is_key_vcl(codec: Codec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    match codec {
        Codec::H264 => (header & 0x1f) == 5,
        Codec::Hevc => matches!((header >> 1) & 0x3f, 16..=21),
    }
}
