//! G.711 mu-law codec and the resampling needed to feed a phone line.

/// Telephony sample rate.
pub const MULAW_SAMPLE_RATE: u32 = 8_000;

/// One 20 ms frame of 8 kHz mu-law.
pub const MULAW_FRAME_BYTES: usize = 160;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn mulaw_to_linear(byte: u8) -> i16 {
    let value = !byte as i32;
    let sign = value & 0x80;
    let exponent = (value >> 4) & 0x07;
    let mantissa = value & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    (if sign != 0 { -magnitude } else { magnitude }) as i16
}

/// Reduce the sample rate. Integer ratios average each group of input
/// samples; other ratios pick the nearest preceding sample.
pub fn downsample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate <= to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    if from_rate % to_rate == 0 {
        let ratio = (from_rate / to_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|group| {
                let sum: i32 = group.iter().map(|&s| s as i32).sum();
                (sum / group.len() as i32) as i16
            })
            .collect();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    (0..out_len)
        .map(|i| samples[(i as u64 * from_rate as u64 / to_rate as u64) as usize])
        .collect()
}

/// 16-bit little-endian PCM at `sample_rate` to 8 kHz mu-law.
pub fn pcm16le_to_mulaw(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    downsample(&samples, sample_rate, MULAW_SAMPLE_RATE)
        .into_iter()
        .map(linear_to_mulaw)
        .collect()
}

/// Split audio into fixed-size frames; the last frame may be short.
pub fn chunk_frames(audio: &[u8], frame_bytes: usize) -> impl Iterator<Item = &[u8]> {
    audio.chunks(frame_bytes.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_encodes_to_ff() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(mulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn codec_round_trip_is_within_quantization() {
        for sample in [-32_000i16, -8_000, -100, 50, 1_000, 12_345, 32_767] {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            assert!(error <= (sample as i32).abs() / 16 + 8, "{sample} -> {decoded}");
        }
    }

    #[test]
    fn sign_is_preserved() {
        assert!(mulaw_to_linear(linear_to_mulaw(5_000)) > 0);
        assert!(mulaw_to_linear(linear_to_mulaw(-5_000)) < 0);
    }

    #[test]
    fn downsample_24k_averages_triples() {
        let out = downsample(&[3, 3, 3, 30, 30, 30, 9], 24_000, 8_000);
        assert_eq!(out, vec![3, 30, 9]);
    }

    #[test]
    fn pcm_bytes_become_one_byte_per_output_sample() {
        let pcm: Vec<u8> = std::iter::repeat_n(0i16.to_le_bytes(), 480).flatten().collect();
        let mulaw = pcm16le_to_mulaw(&pcm, 24_000);
        assert_eq!(mulaw.len(), 160);
        assert!(mulaw.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn frames_are_160_bytes_with_short_tail() {
        let audio = vec![0u8; 400];
        let sizes: Vec<usize> = chunk_frames(&audio, MULAW_FRAME_BYTES).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![160, 160, 80]);
    }
}
