//! AVIS sequence encoding
//!
//! Encodes an ordered run of equal-size RGBA frames as an AV1 image
//! sequence: every frame becomes an intra-coded AV1 sample, and the samples
//! are wrapped in an `avis`-brand ISOBMFF container holding a single `pict`
//! track. The host runtime decodes individual frames by sample index, so the
//! track timing is nominal.
//!
//! The flow per frame:
//!   1. RGBA pixels → ffmpeg `frame::Video` (RGBA)
//!   2. swscale RGBA → YUV420P (required by the AV1 encoders)
//!   3. AV1 encoder (intra only) → one OBU sample per frame
//! then the samples are laid out in a single `mdat` chunk.

use crate::{ffmpeg_crf, EncoderConfig, Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use image::RgbaImage;
use std::io::Write;

// Encoder preference list; first one FFmpeg can find wins.
pub(crate) const ENCODER_NAMES: &[&str] = &["libsvtav1", "libaom-av1", "librav1e"];

// Nominal track timing (10 fps at a millisecond timescale).
const TIMESCALE: u32 = 1000;
const FRAME_DURATION: u32 = 100;

/// Probes whether an FFmpeg AV1 encoder is usable in this process and
/// returns its name.
pub fn probe_backend() -> Option<&'static str> {
    if ffmpeg_next::init().is_err() {
        return None;
    }
    ENCODER_NAMES
        .iter()
        .copied()
        .find(|name| ffmpeg_next::encoder::find_by_name(name).is_some())
}

/// Encodes an ordered list of equal-size RGBA frames into an AVIS container.
///
/// Fails with [`Error::NoFrames`] on an empty list and
/// [`Error::DimensionMismatch`] when any frame deviates from
/// `width` × `height`.
pub fn encode_avis(
    frames: &[RgbaImage],
    width: u32,
    height: u32,
    config: &EncoderConfig,
) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(Error::NoFrames);
    }
    for (i, frame) in frames.iter().enumerate() {
        if frame.width() != width || frame.height() != height {
            return Err(Error::DimensionMismatch {
                frame: i,
                got_w: frame.width(),
                got_h: frame.height(),
                want_w: width,
                want_h: height,
            });
        }
    }

    // SVT-AV1 (and some other encoders) require a minimum of 64×64. Report
    // a per-group failure so the caller falls back to scatter AVIF.
    if width < 64 || height < 64 {
        return Err(Error::EncodeFailed(format!(
            "frames too small for the AV1 sequence encoder ({width}x{height}, min 64x64)"
        )));
    }

    // YUV420P requires even dimensions; round up and pad with black.
    let coded_w = (width + 1) & !1;
    let coded_h = (height + 1) & !1;

    let samples = encode_frames_av1(frames, width, height, coded_w, coded_h, config)?;
    build_avis(&samples, width, height, coded_w, coded_h).map_err(Error::Io)
}

/// Runs every frame through an FFmpeg AV1 encoder in intra-only mode and
/// returns one OBU sample per frame, in presentation order.
fn encode_frames_av1(
    frames: &[RgbaImage],
    width: u32,
    height: u32,
    coded_w: u32,
    coded_h: u32,
    config: &EncoderConfig,
) -> Result<Vec<Vec<u8>>> {
    ffmpeg_next::init()?;
    let (codec, encoder_name) = ENCODER_NAMES
        .iter()
        .find_map(|name| ffmpeg_next::encoder::find_by_name(name).map(|c| (c, *name)))
        .ok_or(Error::AvisUnavailable)?;

    let crf = ffmpeg_crf(config.quality);

    let context = ffmpeg_next::codec::context::Context::from_parameters(
        ffmpeg_next::codec::Parameters::new(),
    )?;
    let mut video = context.encoder().video()?;
    video.set_width(coded_w);
    video.set_height(coded_h);
    video.set_format(ffmpeg_next::format::Pixel::YUV420P);
    video.set_time_base(ffmpeg_next::Rational(1, 10));
    // Intra only: every sample must be independently decodable.
    video.set_gop(0);
    video.set_max_b_frames(0);

    let mut opts = ffmpeg_next::Dictionary::new();
    opts.set("crf", &crf.to_string());
    if encoder_name == "libsvtav1" {
        opts.set("preset", &config.speed.clamp(0, 13).to_string());
        // One encoder thread per instance; the outer worker pool already
        // saturates all cores.
        opts.set("svtav1-params", "lp=1:keyint=1");
    } else if encoder_name == "libaom-av1" {
        opts.set("cpu-used", &config.speed.clamp(0, 8).to_string());
        opts.set("usage", "allintra");
        opts.set("row-mt", "1");
    }

    let mut encoder = video.open_as_with(codec, opts).map_err(|e| {
        Error::EncodeFailed(format!(
            "FFmpeg encoder open failed for {encoder_name} ({coded_w}x{coded_h}, crf={crf}): {e}"
        ))
    })?;

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        ffmpeg_next::format::Pixel::RGBA,
        coded_w,
        coded_h,
        ffmpeg_next::format::Pixel::YUV420P,
        coded_w,
        coded_h,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )?;

    let mut collected: Vec<(i64, Vec<u8>)> = Vec::with_capacity(frames.len());
    let mut packet = ffmpeg_next::Packet::empty();

    for (idx, frame) in frames.iter().enumerate() {
        let mut rgba_frame = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGBA,
            coded_w,
            coded_h,
        );

        // Copy source pixels into the top-left corner, respecting the frame
        // stride; any padding column/row stays black.
        {
            let stride = rgba_frame.stride(0);
            let dst = rgba_frame.data_mut(0);
            let src = frame.as_raw();
            let row_bytes = width as usize * 4;
            for y in 0..height as usize {
                let src_off = y * row_bytes;
                let dst_off = y * stride;
                dst[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&src[src_off..src_off + row_bytes]);
            }
        }

        let mut yuv_frame = ffmpeg_next::util::frame::video::Video::empty();
        scaler.run(&rgba_frame, &mut yuv_frame)?;
        yuv_frame.set_pts(Some(idx as i64));

        encoder.send_frame(&yuv_frame)?;
        while encoder.receive_packet(&mut packet).is_ok() {
            let pts = packet.pts().unwrap_or(collected.len() as i64);
            collected.push((pts, packet.data().unwrap_or(&[]).to_vec()));
        }
    }

    encoder.send_eof()?;
    while encoder.receive_packet(&mut packet).is_ok() {
        let pts = packet.pts().unwrap_or(collected.len() as i64);
        collected.push((pts, packet.data().unwrap_or(&[]).to_vec()));
    }

    if collected.len() != frames.len() {
        return Err(Error::EncodeFailed(format!(
            "{encoder_name} produced {} samples for {} frames",
            collected.len(),
            frames.len()
        )));
    }

    collected.sort_by_key(|(pts, _)| *pts);
    Ok(collected.into_iter().map(|(_, data)| data).collect())
}

// ─────────────────────────────────────────────────────────────────────────
//  AVIS (ISOBMFF image sequence) container writer
//
//  Layout:
//    ftyp  (major brand "avis")
//    moov
//      mvhd
//      trak
//        tkhd  (display width/height)
//        mdia
//          mdhd
//          hdlr  ("pict")
//          minf
//            vmhd, dinf/dref
//            stbl: stsd("av01" + av1C), stts, stsc, stsz, stco
//    mdat  (all samples, one chunk)
// ─────────────────────────────────────────────────────────────────────────

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000, 0, 0, //
    0, 0x0001_0000, 0, //
    0, 0, 0x4000_0000,
];

fn build_avis(
    samples: &[Vec<u8>],
    width: u32,
    height: u32,
    coded_w: u32,
    coded_h: u32,
) -> std::io::Result<Vec<u8>> {
    let ftyp = build_ftyp()?;

    // The moov size does not depend on the chunk offset value (fixed-width
    // field), so build once to measure, then again with the real offset.
    let probe = build_moov(samples, width, height, coded_w, coded_h, 0)?;
    let chunk_offset = (ftyp.len() + probe.len() + 8) as u32;
    let moov = build_moov(samples, width, height, coded_w, coded_h, chunk_offset)?;
    debug_assert_eq!(probe.len(), moov.len());

    let mut out = Vec::with_capacity(
        ftyp.len() + moov.len() + 8 + samples.iter().map(Vec::len).sum::<usize>(),
    );
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);

    let mut mdat = Vec::new();
    for sample in samples {
        mdat.extend_from_slice(sample);
    }
    write_box(&mut out, b"mdat", &mdat)?;
    Ok(out)
}

fn build_ftyp() -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    body.extend_from_slice(b"avis"); // major brand
    body.write_u32::<BigEndian>(0)?; // minor version
    for brand in [b"avis", b"msf1", b"iso8", b"mif1", b"miaf", b"avif"] {
        body.extend_from_slice(brand);
    }
    let mut out = Vec::new();
    write_box(&mut out, b"ftyp", &body)?;
    Ok(out)
}

fn build_moov(
    samples: &[Vec<u8>],
    width: u32,
    height: u32,
    coded_w: u32,
    coded_h: u32,
    chunk_offset: u32,
) -> std::io::Result<Vec<u8>> {
    let n = samples.len() as u32;
    let duration = n * FRAME_DURATION;

    // mvhd
    let mut mvhd = Vec::new();
    mvhd.write_u32::<BigEndian>(0)?; // creation_time
    mvhd.write_u32::<BigEndian>(0)?; // modification_time
    mvhd.write_u32::<BigEndian>(TIMESCALE)?;
    mvhd.write_u32::<BigEndian>(duration)?;
    mvhd.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    mvhd.write_u16::<BigEndian>(0x0100)?; // volume
    mvhd.write_u16::<BigEndian>(0)?; // reserved
    mvhd.write_u32::<BigEndian>(0)?;
    mvhd.write_u32::<BigEndian>(0)?;
    for v in UNITY_MATRIX {
        mvhd.write_u32::<BigEndian>(v)?;
    }
    for _ in 0..6 {
        mvhd.write_u32::<BigEndian>(0)?; // pre_defined
    }
    mvhd.write_u32::<BigEndian>(2)?; // next_track_ID

    // tkhd (flags: enabled + in movie); display dimensions in 16.16
    let mut tkhd = Vec::new();
    tkhd.write_u32::<BigEndian>(0)?; // creation_time
    tkhd.write_u32::<BigEndian>(0)?; // modification_time
    tkhd.write_u32::<BigEndian>(1)?; // track_ID
    tkhd.write_u32::<BigEndian>(0)?; // reserved
    tkhd.write_u32::<BigEndian>(duration)?;
    tkhd.write_u32::<BigEndian>(0)?;
    tkhd.write_u32::<BigEndian>(0)?;
    tkhd.write_u16::<BigEndian>(0)?; // layer
    tkhd.write_u16::<BigEndian>(0)?; // alternate_group
    tkhd.write_u16::<BigEndian>(0)?; // volume (non-audio)
    tkhd.write_u16::<BigEndian>(0)?; // reserved
    for v in UNITY_MATRIX {
        tkhd.write_u32::<BigEndian>(v)?;
    }
    tkhd.write_u32::<BigEndian>(width << 16)?;
    tkhd.write_u32::<BigEndian>(height << 16)?;

    // mdhd
    let mut mdhd = Vec::new();
    mdhd.write_u32::<BigEndian>(0)?;
    mdhd.write_u32::<BigEndian>(0)?;
    mdhd.write_u32::<BigEndian>(TIMESCALE)?;
    mdhd.write_u32::<BigEndian>(duration)?;
    mdhd.write_u16::<BigEndian>(0x55C4)?; // language "und"
    mdhd.write_u16::<BigEndian>(0)?; // pre_defined

    // hdlr ("pict")
    let mut hdlr = Vec::new();
    hdlr.write_u32::<BigEndian>(0)?; // pre_defined
    hdlr.extend_from_slice(b"pict");
    for _ in 0..3 {
        hdlr.write_u32::<BigEndian>(0)?; // reserved
    }
    hdlr.push(0); // name (empty, NUL-terminated)

    // vmhd
    let mut vmhd = Vec::new();
    vmhd.write_u16::<BigEndian>(0)?; // graphicsmode
    for _ in 0..3 {
        vmhd.write_u16::<BigEndian>(0)?; // opcolor
    }

    // dinf/dref with one self-contained url entry
    let mut dref = Vec::new();
    dref.write_u32::<BigEndian>(1)?; // entry_count
    write_fullbox(&mut dref, b"url ", 0, 1, &[])?;
    let mut dinf = Vec::new();
    write_fullbox(&mut dinf, b"dref", 0, 0, &dref)?;

    // stbl
    let mut stbl = Vec::new();
    {
        // stsd with one av01 sample entry
        let av01 = build_av01_entry(samples, coded_w, coded_h)?;
        let mut stsd = Vec::new();
        stsd.write_u32::<BigEndian>(1)?; // entry_count
        stsd.extend_from_slice(&av01);
        write_fullbox(&mut stbl, b"stsd", 0, 0, &stsd)?;

        // stts: every sample has the same duration
        let mut stts = Vec::new();
        stts.write_u32::<BigEndian>(1)?;
        stts.write_u32::<BigEndian>(n)?;
        stts.write_u32::<BigEndian>(FRAME_DURATION)?;
        write_fullbox(&mut stbl, b"stts", 0, 0, &stts)?;

        // stsc: all samples in one chunk
        let mut stsc = Vec::new();
        stsc.write_u32::<BigEndian>(1)?;
        stsc.write_u32::<BigEndian>(1)?; // first_chunk
        stsc.write_u32::<BigEndian>(n)?; // samples_per_chunk
        stsc.write_u32::<BigEndian>(1)?; // sample_description_index
        write_fullbox(&mut stbl, b"stsc", 0, 0, &stsc)?;

        // stsz: per-sample sizes
        let mut stsz = Vec::new();
        stsz.write_u32::<BigEndian>(0)?; // sample_size (varies)
        stsz.write_u32::<BigEndian>(n)?;
        for sample in samples {
            stsz.write_u32::<BigEndian>(sample.len() as u32)?;
        }
        write_fullbox(&mut stbl, b"stsz", 0, 0, &stsz)?;

        // stco: the single chunk starts at the mdat payload
        let mut stco = Vec::new();
        stco.write_u32::<BigEndian>(1)?;
        stco.write_u32::<BigEndian>(chunk_offset)?;
        write_fullbox(&mut stbl, b"stco", 0, 0, &stco)?;
    }

    // Assemble minf → mdia → trak → moov
    let mut minf = Vec::new();
    write_fullbox(&mut minf, b"vmhd", 0, 1, &vmhd)?;
    write_box(&mut minf, b"dinf", &dinf)?;
    write_box(&mut minf, b"stbl", &stbl)?;

    let mut mdia = Vec::new();
    write_fullbox(&mut mdia, b"mdhd", 0, 0, &mdhd)?;
    write_fullbox(&mut mdia, b"hdlr", 0, 0, &hdlr)?;
    write_box(&mut mdia, b"minf", &minf)?;

    let mut trak = Vec::new();
    write_fullbox(&mut trak, b"tkhd", 0, 3, &tkhd)?;
    write_box(&mut trak, b"mdia", &mdia)?;

    let mut moov_body = Vec::new();
    write_fullbox(&mut moov_body, b"mvhd", 0, 0, &mvhd)?;
    moov_body.extend_from_slice(&trak);

    let mut out = Vec::new();
    write_box(&mut out, b"moov", &moov_body)?;
    Ok(out)
}

/// Builds the `av01` VisualSampleEntry, coded dimensions included.
fn build_av01_entry(samples: &[Vec<u8>], coded_w: u32, coded_h: u32) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 6]); // reserved
    body.write_u16::<BigEndian>(1)?; // data_reference_index
    body.write_u16::<BigEndian>(0)?; // pre_defined
    body.write_u16::<BigEndian>(0)?; // reserved
    for _ in 0..3 {
        body.write_u32::<BigEndian>(0)?; // pre_defined
    }
    body.write_u16::<BigEndian>(coded_w as u16)?;
    body.write_u16::<BigEndian>(coded_h as u16)?;
    body.write_u32::<BigEndian>(0x0048_0000)?; // horizresolution 72 dpi
    body.write_u32::<BigEndian>(0x0048_0000)?; // vertresolution
    body.write_u32::<BigEndian>(0)?; // reserved
    body.write_u16::<BigEndian>(1)?; // frame_count
    body.extend_from_slice(&[0u8; 32]); // compressorname
    body.write_u16::<BigEndian>(0x0018)?; // depth
    body.write_i16::<BigEndian>(-1)?; // pre_defined

    let first = samples.first().map(Vec::as_slice).unwrap_or(&[]);
    write_box(&mut body, b"av1C", &build_av1c(first))?;

    let mut out = Vec::new();
    write_box(&mut out, b"av01", &body)?;
    Ok(out)
}

/// Builds an AV1CodecConfigurationRecord from a raw OBU bitstream.
/// See AV1-ISOBMFF §2.3. Minimal form for intra-only samples.
fn build_av1c(sample: &[u8]) -> Vec<u8> {
    let (profile, level) = parse_sequence_header(sample).unwrap_or((0, 0));
    vec![
        0x81, // marker=1, version=1
        (profile << 5) | (level & 0x1F),
        // tier=0, 8-bit, not monochrome, 4:2:0, chroma position unknown
        0b0000_0110,
        0x00, // no initial_presentation_delay
    ]
}

/// Extracts `seq_profile` and `seq_level_idx_0` from the first Sequence
/// Header OBU in a raw AV1 bitstream.
fn parse_sequence_header(data: &[u8]) -> Option<(u8, u8)> {
    let mut i = 0;
    while i < data.len() {
        let header = data[i];
        let obu_type = (header >> 3) & 0x0F;
        let has_extension = (header >> 2) & 1 == 1;
        let has_size = (header >> 1) & 1 == 1;
        i += 1;
        if has_extension {
            i += 1;
        }
        let obu_size = if has_size {
            let (size, consumed) = read_leb128(data.get(i..)?)?;
            i += consumed;
            size
        } else {
            data.len().checked_sub(i)?
        };

        if obu_type == 1 {
            // OBU_SEQUENCE_HEADER
            let first = *data.get(i)?;
            let seq_profile = (first >> 5) & 0x07;
            let reduced = (first >> 3) & 1 == 1;
            if reduced {
                // seq_level_idx_0 straddles the byte boundary
                let level = ((first & 0x07) << 2) | (data.get(i + 1)? >> 6);
                return Some((seq_profile, level));
            }
            return Some((seq_profile, 0));
        }
        i += obu_size;
    }
    None
}

fn read_leb128(data: &[u8]) -> Option<(usize, usize)> {
    let mut value: u64 = 0;
    for (consumed, &byte) in data.iter().take(8).enumerate() {
        value |= u64::from(byte & 0x7F) << (consumed * 7);
        if byte & 0x80 == 0 {
            return Some((value as usize, consumed + 1));
        }
    }
    None
}

// ── ISOBMFF box helpers ──

fn write_box(out: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) -> std::io::Result<()> {
    out.write_u32::<BigEndian>((8 + body.len()) as u32)?;
    out.write_all(kind)?;
    out.write_all(body)?;
    Ok(())
}

fn write_fullbox(
    out: &mut Vec<u8>,
    kind: &[u8; 4],
    version: u8,
    flags: u32,
    body: &[u8],
) -> std::io::Result<()> {
    out.write_u32::<BigEndian>((12 + body.len()) as u32)?;
    out.write_all(kind)?;
    out.write_u32::<BigEndian>((u32::from(version) << 24) | (flags & 0x00FF_FFFF))?;
    out.write_all(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame_list_is_rejected() {
        let err = encode_avis(&[], 64, 64, &EncoderConfig::default()).unwrap_err();
        assert!(matches!(err, Error::NoFrames));
    }

    #[test]
    fn test_mismatched_sizes_are_rejected() {
        let frames = vec![RgbaImage::new(64, 64), RgbaImage::new(64, 66)];
        let err = encode_avis(&frames, 64, 64, &EncoderConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { frame: 1, .. }));
        assert!(err.to_string().contains("size"), "got: {err}");
    }

    #[test]
    fn test_box_layout() {
        let mut out = Vec::new();
        write_box(&mut out, b"mdat", b"xyz").unwrap();
        assert_eq!(out[..4], 11u32.to_be_bytes());
        assert_eq!(&out[4..8], b"mdat");
        assert_eq!(&out[8..], b"xyz");

        let mut full = Vec::new();
        write_fullbox(&mut full, b"stco", 0, 1, &[0xAA]).unwrap();
        assert_eq!(full[..4], 13u32.to_be_bytes());
        assert_eq!(&full[4..8], b"stco");
        assert_eq!(full[8..12], [0, 0, 0, 1]);
    }

    #[test]
    fn test_container_shape_without_codec() {
        // build_avis is pure over already-encoded samples
        let samples = vec![vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]];
        let avis = build_avis(&samples, 100, 50, 100, 50).unwrap();

        assert_eq!(&avis[4..8], b"ftyp");
        assert_eq!(&avis[8..12], b"avis");
        let tail = &avis[avis.len() - (8 + 60)..];
        assert_eq!(&tail[4..8], b"mdat");
        assert_eq!(&tail[8..18], &[1u8; 10][..]);

        // the declared chunk offset points at the first sample
        let pos = avis.windows(4).position(|w| w == b"stco").unwrap();
        let declared =
            u32::from_be_bytes(avis[pos + 8..pos + 12].try_into().unwrap()); // entry_count
        assert_eq!(declared, 1);
        let offset =
            u32::from_be_bytes(avis[pos + 12..pos + 16].try_into().unwrap()) as usize;
        assert_eq!(&avis[offset..offset + 10], &[1u8; 10][..]);
    }

    #[test]
    fn test_leb128() {
        assert_eq!(read_leb128(&[0x05]), Some((5, 1)));
        assert_eq!(read_leb128(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_leb128(&[]), None);
    }

    #[test]
    fn test_av1c_defaults_on_opaque_payload() {
        let av1c = build_av1c(&[0xFF, 0xFF]);
        assert_eq!(av1c[0], 0x81);
        assert_eq!(av1c.len(), 4);
    }
}
