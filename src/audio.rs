/// PCM16 audio utilities: resampling, framing, µ-law conversion.
///
/// All functions operate on raw bytes (16-bit LE PCM, mono) at one of the
/// three rates the bridge speaks:
///
/// ```text
///   8 kHz   telephony (µ-law trunks)
///  16 kHz   telephony (wideband) + model ingest + recordings
///  24 kHz   model egress
/// ```
///
/// Resampling is linear interpolation, which is adequate for voice at these
/// ratios. Output sample counts are deterministic: `n_out` is `n_in × dst/src`
/// rounded to nearest, ties to even. Callers tolerate ±1 sample of drift per
/// conversion.
use thiserror::Error;

/// Rates the codec accepts.
pub const SUPPORTED_RATES: [u32; 3] = [8_000, 16_000, 24_000];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    /// Buffer length is not a whole number of 16-bit samples.
    #[error("PCM16 buffer length {0} is not a multiple of 2")]
    InvalidFormat(usize),

    #[error("unsupported sample rate {0} (supported: 8000, 16000, 24000)")]
    UnsupportedRate(u32),
}

fn check_rate(rate: u32) -> Result<(), AudioError> {
    if SUPPORTED_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(AudioError::UnsupportedRate(rate))
    }
}

fn parse_samples(pcm: &[u8]) -> Result<Vec<i16>, AudioError> {
    if pcm.len() % 2 != 0 {
        return Err(AudioError::InvalidFormat(pcm.len()));
    }
    Ok(pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Round to nearest, ties to even (banker's rounding on the .5 boundary).
fn round_half_even(x: f64) -> usize {
    let floor = x.floor();
    let frac = x - floor;
    let n = floor as usize;
    if frac > 0.5 {
        n + 1
    } else if frac < 0.5 {
        n
    } else if n % 2 == 0 {
        n
    } else {
        n + 1
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Resampling — linear interpolation
// ═══════════════════════════════════════════════════════════════════════

/// Resample PCM16 between any two supported rates.
///
/// Identity (a copy) when `src_rate == dst_rate`. Never emits a partial
/// sample: the output is always a whole number of 16-bit frames.
pub fn resample(pcm: &[u8], src_rate: u32, dst_rate: u32) -> Result<Vec<u8>, AudioError> {
    check_rate(src_rate)?;
    check_rate(dst_rate)?;

    let src = parse_samples(pcm)?;
    if src_rate == dst_rate {
        return Ok(pcm.to_vec());
    }

    let n_in = src.len();
    if n_in == 0 {
        return Ok(Vec::new());
    }

    let n_out = round_half_even((n_in as f64) * (dst_rate as f64) / (src_rate as f64));
    let mut out = Vec::with_capacity(n_out * 2);

    if n_out <= 1 {
        out.extend_from_slice(&src[0].to_le_bytes());
        return Ok(out);
    }

    for j in 0..n_out {
        let pos = (j as f64) * ((n_in - 1) as f64) / ((n_out - 1) as f64);
        let idx = pos as usize;
        let frac = pos - (idx as f64);

        let s = if idx + 1 < n_in {
            ((src[idx] as f64) * (1.0 - frac) + (src[idx + 1] as f64) * frac).round() as i16
        } else {
            src[n_in - 1]
        };

        out.extend_from_slice(&s.to_le_bytes());
    }

    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════
//  Framing
// ═══════════════════════════════════════════════════════════════════════

/// Split PCM16 into fixed-duration frames (typically 20 ms).
///
/// The trailing partial frame, if any, is zero-padded to full length.
pub fn chunk(pcm: &[u8], frame_ms: u32, rate: u32) -> Result<Vec<Vec<u8>>, AudioError> {
    check_rate(rate)?;
    if pcm.len() % 2 != 0 {
        return Err(AudioError::InvalidFormat(pcm.len()));
    }

    let frame_bytes = ((rate as usize) * (frame_ms as usize) / 1000) * 2;
    if frame_bytes == 0 || pcm.is_empty() {
        return Ok(Vec::new());
    }

    let mut frames = Vec::with_capacity(pcm.len() / frame_bytes + 1);
    for raw in pcm.chunks(frame_bytes) {
        if raw.len() == frame_bytes {
            frames.push(raw.to_vec());
        } else {
            let mut padded = raw.to_vec();
            padded.resize(frame_bytes, 0);
            frames.push(padded);
        }
    }
    Ok(frames)
}

/// Concatenate PCM buffers.
pub fn concat(bufs: &[Vec<u8>]) -> Vec<u8> {
    let total = bufs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for b in bufs {
        out.extend_from_slice(b);
    }
    out
}

/// Duration of a PCM16 mono buffer in milliseconds.
pub fn duration_ms(len_bytes: usize, rate: u32) -> u64 {
    let samples = (len_bytes / 2) as u64;
    samples * 1000 / (rate as u64)
}

// ═══════════════════════════════════════════════════════════════════════
//  G.711 µ-law <-> PCM16
// ═══════════════════════════════════════════════════════════════════════

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign: u8 = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    if s > MULAW_CLIP {
        s = MULAW_CLIP;
    }
    s += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((s >> (exponent + 3)) & 0x0f) as u8;
    !(sign | (exponent << 4) | mantissa)
}

fn mulaw_decode_sample(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = (b >> 4) & 0x07;
    let mantissa = (b & 0x0f) as i32;
    let mut s = ((mantissa << 3) + MULAW_BIAS) << exponent;
    s -= MULAW_BIAS;
    if sign != 0 {
        (-s) as i16
    } else {
        s as i16
    }
}

/// Encode PCM16-LE to 8-bit µ-law (one byte per sample).
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Result<Vec<u8>, AudioError> {
    let samples = parse_samples(pcm)?;
    Ok(samples.into_iter().map(mulaw_encode_sample).collect())
}

/// Decode 8-bit µ-law to PCM16-LE.
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(mulaw.len() * 2);
    for &b in mulaw {
        out.extend_from_slice(&mulaw_decode_sample(b).to_le_bytes());
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(n: usize, rate: f64) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = (i as f64) / rate;
            let s = (t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 16_000.0;
            pcm.extend_from_slice(&(s as i16).to_le_bytes());
        }
        pcm
    }

    #[test]
    fn test_resample_round_trip_duration() {
        let pcm = sine_pcm(16_000, 16_000.0);
        let up = resample(&pcm, 16_000, 24_000).unwrap();
        let back = resample(&up, 24_000, 16_000).unwrap();

        let n_orig = (pcm.len() / 2) as i64;
        let n_back = (back.len() / 2) as i64;
        assert!(
            (n_orig - n_back).abs() <= 1,
            "sample count drift: {} vs {}",
            n_orig,
            n_back
        );

        // First 100 samples should be close
        for i in 0..100 {
            let a = i16::from_le_bytes([pcm[i * 2], pcm[i * 2 + 1]]);
            let b = i16::from_le_bytes([back[i * 2], back[i * 2 + 1]]);
            assert!(
                ((a as i32) - (b as i32)).abs() < 500,
                "sample {} too different: {} vs {}",
                i,
                a,
                b
            );
        }
    }

    #[test]
    fn test_resample_ratio() {
        // 700 samples @ 16 kHz -> 1050 @ 24 kHz
        let pcm = vec![0u8; 700 * 2];
        let up = resample(&pcm, 16_000, 24_000).unwrap();
        assert_eq!(up.len() / 2, 1050, "16->24 ratio wrong");

        let down = resample(&up, 24_000, 16_000).unwrap();
        assert_eq!(down.len() / 2, 700, "24->16 ratio wrong");
    }

    #[test]
    fn test_resample_empty_and_identity() {
        assert!(resample(&[], 16_000, 24_000).unwrap().is_empty());
        let pcm = sine_pcm(320, 16_000.0);
        assert_eq!(resample(&pcm, 16_000, 16_000).unwrap(), pcm);
    }

    #[test]
    fn test_resample_rejects_bad_input() {
        assert_eq!(
            resample(&[0u8; 3], 16_000, 24_000),
            Err(AudioError::InvalidFormat(3))
        );
        assert_eq!(
            resample(&[0u8; 4], 44_100, 16_000),
            Err(AudioError::UnsupportedRate(44_100))
        );
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(2.5), 2);
        assert_eq!(round_half_even(3.5), 4);
        assert_eq!(round_half_even(2.4), 2);
        assert_eq!(round_half_even(2.6), 3);
    }

    #[test]
    fn test_chunk_pads_trailing_frame() {
        // 50 ms at 16 kHz = 800 samples; 20 ms frames = 320 samples each
        let pcm = vec![1u8; 800 * 2];
        let frames = chunk(&pcm, 20, 16_000).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 320 * 2);
        assert_eq!(frames[2].len(), 320 * 2);
        // Trailing frame: 160 real samples + 160 samples of padding
        assert_eq!(&frames[2][320..], &vec![0u8; 320][..]);
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(16_000 * 2, 16_000), 1000);
        assert_eq!(duration_ms(24_000 * 2, 24_000), 1000);
        assert_eq!(duration_ms(320 * 2, 16_000), 20);
    }

    #[test]
    fn test_mulaw_round_trip_tolerance() {
        // µ-law is lossy; round trip should stay within the top-step error.
        let pcm = sine_pcm(160, 8_000.0);
        let mulaw = pcm16_to_mulaw(&pcm).unwrap();
        assert_eq!(mulaw.len(), 160);
        let back = mulaw_to_pcm16(&mulaw);
        assert_eq!(back.len(), pcm.len());
        for i in 0..160 {
            let a = i16::from_le_bytes([pcm[i * 2], pcm[i * 2 + 1]]) as i32;
            let b = i16::from_le_bytes([back[i * 2], back[i * 2 + 1]]) as i32;
            assert!((a - b).abs() < 1024, "sample {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_mulaw_silence() {
        let silence = vec![0u8; 320];
        let mulaw = pcm16_to_mulaw(&silence).unwrap();
        let back = mulaw_to_pcm16(&mulaw);
        for c in back.chunks_exact(2) {
            let s = i16::from_le_bytes([c[0], c[1]]);
            assert!(s.abs() <= 8, "silence decoded to {}", s);
        }
    }

    #[test]
    fn test_concat() {
        let a = vec![1u8, 2];
        let b = vec![3u8, 4];
        assert_eq!(concat(&[a, b]), vec![1, 2, 3, 4]);
    }
}
