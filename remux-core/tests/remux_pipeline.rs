// End-to-end pipeline: demux a synthetic AVI, feed a cluster's worth of
// frames through the cue accumulator, postprocess against the written
// cluster bytes and verify the exact-size CUES emission.

use std::collections::HashMap;
use std::io::Cursor;

use anyhow::Result;

use remux_core::cues::{CuePoint, Cues};
use remux_core::ebml::{write_element_head, Vint};
use remux_core::io::ByteSource;
use remux_core::mkv::{element_ids, Cluster, SeekHead};
use remux_core::{DemuxOptions, InputFormat, MediaReader};

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ----------------------------------------------------------------------
// synthetic AVI
// ----------------------------------------------------------------------

fn chunk(fcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = fcc.to_vec();
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        v.push(0);
    }
    v
}

fn list(subtype: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut payload = subtype.to_vec();
    payload.extend_from_slice(children);
    chunk(b"LIST", &payload)
}

fn build_avi(frame_payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut avih = Vec::new();
    for dw in [
        40_000u32,
        0,
        0,
        0,
        frame_payloads.len() as u32,
        0,
        1,
        0,
        320,
        240,
        0,
        0,
        0,
        0,
    ] {
        avih.extend_from_slice(&dw.to_le_bytes());
    }

    let mut strh = Vec::new();
    strh.extend_from_slice(b"vids");
    strh.extend_from_slice(b"MJPG");
    strh.extend_from_slice(&[0u8; 12]);
    strh.extend_from_slice(&1u32.to_le_bytes()); // scale
    strh.extend_from_slice(&25u32.to_le_bytes()); // rate
    strh.extend_from_slice(&0u32.to_le_bytes());
    strh.extend_from_slice(&(frame_payloads.len() as u32).to_le_bytes());
    strh.extend_from_slice(&[0u8; 20]);

    let mut strf = Vec::new();
    strf.extend_from_slice(&40u32.to_le_bytes());
    strf.extend_from_slice(&320u32.to_le_bytes());
    strf.extend_from_slice(&240u32.to_le_bytes());
    strf.extend_from_slice(&1u16.to_le_bytes());
    strf.extend_from_slice(&24u16.to_le_bytes());
    strf.extend_from_slice(b"MJPG");
    strf.extend_from_slice(&[0u8; 20]);

    let mut strl = chunk(b"strh", &strh);
    strl.extend_from_slice(&chunk(b"strf", &strf));
    let mut hdrl_children = chunk(b"avih", &avih);
    hdrl_children.extend_from_slice(&list(b"strl", &strl));
    let hdrl = list(b"hdrl", &hdrl_children);

    let movi_base = 12 + hdrl.len() as u32 + 12;
    let mut movi_children = Vec::new();
    let mut positions = Vec::new();
    for payload in frame_payloads {
        positions.push(movi_base + movi_children.len() as u32);
        movi_children.extend_from_slice(&chunk(b"00dc", payload));
    }
    let movi = list(b"movi", &movi_children);

    let mut idx = Vec::new();
    for (pos, payload) in positions.iter().zip(frame_payloads) {
        idx.extend_from_slice(b"00dc");
        idx.extend_from_slice(&0x10u32.to_le_bytes());
        idx.extend_from_slice(&pos.to_le_bytes());
        idx.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }

    let mut body = hdrl;
    body.extend_from_slice(&movi);
    body.extend_from_slice(&chunk(b"idx1", &idx));
    let mut file = b"RIFF".to_vec();
    file.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
    file.extend_from_slice(b"AVI ");
    file.extend_from_slice(&body);
    file
}

// ----------------------------------------------------------------------
// cluster serialization, the shape a muxer would emit
// ----------------------------------------------------------------------

fn write_cluster(timecode_ticks: u64, blocks: &[(u64, i16, &[u8])]) -> Vec<u8> {
    let mut payload = Vec::new();
    write_element_head(&mut payload, element_ids::TIMECODE, 1);
    payload.push(timecode_ticks as u8);

    for &(track, rel, data) in blocks {
        let mut body = vec![0x80 | track as u8];
        body.extend_from_slice(&rel.to_be_bytes());
        body.push(0x80);
        body.extend_from_slice(data);
        write_element_head(&mut payload, element_ids::SIMPLE_BLOCK, body.len() as u64);
        payload.extend_from_slice(&body);
    }

    let mut out = Vec::new();
    write_element_head(&mut out, element_ids::CLUSTER, payload.len() as u64);
    out.extend_from_slice(&payload);
    out
}

#[test]
fn avi_to_cues_round_trip() -> Result<()> {
    init_tracing();

    let payloads: Vec<Vec<u8>> = (0..5u8).map(|s| vec![s; 64]).collect();
    let avi = build_avi(&payloads);

    let source = ByteSource::new(Cursor::new(avi))?;
    let mut reader = MediaReader::open(source, &DemuxOptions::default())?;
    assert_eq!(reader.format(), InputFormat::Avi);
    assert_eq!(reader.track_count(), 1);
    assert!(!reader.file_is_damaged());

    let descriptor = reader.track_descriptor(0);
    assert_eq!(descriptor.codec_id, "V_MS/VFW/FOURCC");

    // drain the demuxed frames
    let mut frames = Vec::new();
    while let Some((track, frame)) = reader.next_frame()? {
        assert_eq!(track, 0);
        frame.validate()?;
        frames.push(frame);
    }
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.keyframe));

    // pretend the muxer wrote one cluster at a fixed position and cue the
    // keyframes
    let options = DemuxOptions::default();
    let scale = options.timestamp_scale;
    let cluster_file_pos = 0x2000u64;
    let track_num = 1u64;

    let blocks: Vec<(u64, i16, &[u8])> = frames
        .iter()
        .map(|f| {
            (
                track_num,
                (f.timestamp / scale as i64) as i16,
                &f.data[..],
            )
        })
        .collect();
    let cluster_bytes = write_cluster(0, &blocks);
    let cluster = Cluster::parse(&cluster_bytes, cluster_file_pos, scale)?;
    assert_eq!(cluster.blocks.len(), frames.len());

    let mut cues = Cues::new(&options);
    for frame in &frames {
        cues.add(CuePoint {
            timestamp: frame.timestamp as u64,
            duration: 0,
            cluster_position: cluster_file_pos,
            track_num: track_num as u32,
            relative_position: 0,
        });
        cues.set_duration_for(
            track_num,
            frame.timestamp as u64,
            frame.duration.unwrap_or(0) as u64,
        );
    }

    let mut policy = HashMap::new();
    policy.insert(track_num, true);
    cues.postprocess_cues(&cluster, &policy);

    // every cue found its block inside the cluster
    let expected = cues.calculate_total_size();
    let mut out = Vec::new();
    let mut seek_head = SeekHead::new();
    let written = cues.write(&mut out, &mut seek_head);
    assert_eq!(written, expected);
    assert_eq!(seek_head.entries().len(), 1);

    // and the element head agrees with the body byte-for-byte
    let size = Vint::parse(&out[4..])?;
    assert_eq!(size.value as u64, expected);
    assert_eq!(out.len() as u64, 4 + size.coded_size as u64 + expected);

    // the first cue (timestamp 0) points at the first block, which sits
    // right behind the cluster timecode element
    let first_block_relative = cluster.blocks[0].position - cluster.data_start();
    assert!(first_block_relative > 0);
    assert!(out
        .windows(2)
        .any(|w| w[0] == element_ids::CUE_RELATIVE_POSITION as u8 && w[1] == 0x81));

    Ok(())
}
