use crate::bitstream::AccessUnit;

/// Serializes an access unit into one container sample.
pub trait SamplePacker {
    fn pack(&mut self, access_unit: &AccessUnit) -> Vec<u8>;
}

/// Four-byte start code before each NAL unit.
#[derive(Debug, Default)]
pub struct AnnexBPacker;

impl SamplePacker for AnnexBPacker {
    fn pack(&mut self, access_unit: &AccessUnit) -> Vec<u8> {
        let mut data = Vec::with_capacity(packed_len(access_unit));
        for nal in &access_unit.nalus {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }
        data
    }
}

fn packed_len(access_unit: &AccessUnit) -> usize {
    access_unit
        .nalus
        .iter()
        .map(|nal| nal.len().saturating_add(4))
        .sum()
}
