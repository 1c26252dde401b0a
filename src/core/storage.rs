//! Checkpoint images.
//!
//! Layout: 8-byte magic, a `u32` version, then tagged chunks. Each chunk is
//! `tag: [u8; 4]`, `len: u32`, `uncompressed_len: u32` and an LZ4 block.
//! Scalars are little-endian.
//!
//! - `CNFG`: top_n, snapshot flag, sentinel, execution tier, stream position.
//! - `OUTS`: output names and dims, in record order.
//! - `RECD`: one per record; record index then quantities, indices and an
//!   optional snapshot, each in row-major order.
//!
//! Unknown chunks are skipped.

use std::io::{self, Read, Write};

use crate::record::{OutputDims, SentinelPolicy, StatisticsRecord};
use crate::search::{MaximumActivationSearch, SearchConfig};
use crate::tensor::{element_count, Tensor};
use crate::topn::ExecutionTier;

pub const MAGIC: &[u8; 8] = b"MAXACT01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// A sink that only counts bytes, for sizing images without buffering them.
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write a `usize` as `u32`, failing if it does not fit.
pub fn write_len_le<W: Write>(w: &mut W, v: usize) -> io::Result<()> {
    let v = u32::try_from(v).map_err(|_| invalid("length exceeds u32"))?;
    write_u32_le(w, v)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_len_le(w, s.len())?;
    w.write_all(s.as_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let n = read_u32_le(r)? as usize;
    let mut buf = Vec::new();
    r.take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    String::from_utf8(buf).map_err(|_| invalid("invalid utf-8 string"))
}

/// Write a chunk whose payload is LZ4-compressed and preceded by its
/// uncompressed length.
///
/// - tag: `[u8; 4]`
/// - len: `u32`, bytes that follow (including the uncompressed length)
/// - uncompressed_len: `u32`
/// - compressed payload
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len =
        u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len()).map_err(|_| invalid("chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(invalid("truncated chunk"));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

/// Remaining bytes in `cursor` must cover `count` elements of `width` bytes.
fn ensure_remaining(cursor: &io::Cursor<Vec<u8>>, count: usize, width: usize) -> io::Result<()> {
    let needed = count
        .checked_mul(width)
        .ok_or_else(|| invalid("tensor too large"))?;
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if (needed as u64) > remaining {
        return Err(invalid("truncated tensor"));
    }
    Ok(())
}

fn read_f32_tensor(cursor: &mut io::Cursor<Vec<u8>>, shape: &[usize]) -> io::Result<Tensor<f32>> {
    let n = element_count(shape).ok_or_else(|| invalid("tensor too large"))?;
    ensure_remaining(cursor, n, 4)?;
    let mut data = Vec::with_capacity(n);
    for _ in 0..n {
        data.push(read_f32_le(cursor)?);
    }
    Tensor::from_vec(shape, data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_u64_tensor(cursor: &mut io::Cursor<Vec<u8>>, shape: &[usize]) -> io::Result<Tensor<u64>> {
    let n = element_count(shape).ok_or_else(|| invalid("tensor too large"))?;
    ensure_remaining(cursor, n, 8)?;
    let mut data = Vec::with_capacity(n);
    for _ in 0..n {
        data.push(read_u64_le(cursor)?);
    }
    Tensor::from_vec(shape, data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn sentinel_code(s: SentinelPolicy) -> u8 {
    match s {
        SentinelPolicy::Zero => 0,
        SentinelPolicy::NegativeInfinity => 1,
    }
}

fn sentinel_from_code(code: u8) -> io::Result<SentinelPolicy> {
    match code {
        0 => Ok(SentinelPolicy::Zero),
        1 => Ok(SentinelPolicy::NegativeInfinity),
        _ => Err(invalid("unknown sentinel policy")),
    }
}

fn tier_code(t: ExecutionTier) -> u8 {
    match t {
        ExecutionTier::Scalar => 0,
        ExecutionTier::Parallel => 1,
    }
}

fn tier_from_code(code: u8) -> io::Result<ExecutionTier> {
    match code {
        0 => Ok(ExecutionTier::Scalar),
        1 => Ok(ExecutionTier::Parallel),
        _ => Err(invalid("unknown execution tier")),
    }
}

struct SavedConfig {
    config: SearchConfig,
    stream_position: u64,
}

struct SavedBuffers {
    quantities: Tensor<f32>,
    indices: Tensor<u64>,
    snapshot: Option<Tensor<f32>>,
}

impl MaximumActivationSearch {
    /// Serialize the full search state as a versioned, chunked image.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        write_u32_le(w, VERSION_CURRENT)?;

        self.write_cfg_chunk(w)?;
        self.write_outputs_chunk(w)?;
        for (i, record) in self.records().iter().enumerate() {
            Self::write_record_chunk(w, i, record)?;
        }
        Ok(())
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    /// Exact serialized size in bytes of the current image.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    /// Load an image written by [`save_image_to`](Self::save_image_to).
    ///
    /// Every buffer shape is checked against the saved dims and `top_n`.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = read_exact::<8, _>(r)?;
        if &magic != MAGIC {
            return Err(invalid("bad image magic"));
        }
        let version = read_u32_le(r)?;
        if version != VERSION_CURRENT {
            return Err(invalid("unsupported image version"));
        }

        let mut saved: Option<SavedConfig> = None;
        let mut outputs: Option<Vec<(String, OutputDims)>> = None;
        let mut buffers: Vec<Option<SavedBuffers>> = Vec::new();

        loop {
            let (tag, len) = match read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let mut cursor = io::Cursor::new(read_chunk_payload(r, len)?);
            match &tag {
                b"CNFG" => saved = Some(Self::read_cfg_payload(&mut cursor)?),
                b"OUTS" => {
                    let outs = Self::read_outputs_payload(&mut cursor)?;
                    buffers = (0..outs.len()).map(|_| None).collect();
                    outputs = Some(outs);
                }
                b"RECD" => {
                    let (Some(cfg), Some(outs)) = (&saved, &outputs) else {
                        return Err(invalid("RECD before CNFG/OUTS"));
                    };
                    let index = read_u32_le(&mut cursor)? as usize;
                    let dims = outs
                        .get(index)
                        .map(|(_, d)| *d)
                        .ok_or_else(|| invalid("RECD index out of range"))?;
                    let record = Self::read_record_payload(&mut cursor, dims, cfg.config.top_n)?;
                    buffers[index] = Some(record);
                }
                _ => {
                    // Unknown chunk: skipped.
                }
            }
        }

        let saved = saved.ok_or_else(|| invalid("missing CNFG"))?;
        let outputs = outputs.ok_or_else(|| invalid("missing OUTS"))?;
        let top_n = saved.config.top_n;

        let mut records = Vec::with_capacity(outputs.len());
        for ((name, dims), buffers) in outputs.into_iter().zip(buffers) {
            let b = buffers.ok_or_else(|| invalid("missing RECD"))?;
            let record =
                StatisticsRecord::from_parts(name, dims, top_n, b.quantities, b.indices, b.snapshot)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }

        let search = Self::from_records(saved.config, records, saved.stream_position)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::debug!(
            outputs = search.records().len(),
            stream_position = search.stream_position(),
            "loaded maximum activation image"
        );
        Ok(search)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = io::Cursor::new(bytes);
        Self::load_image_from(&mut cursor)
    }

    fn write_cfg_chunk<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let cfg = self.config();
        // top_n + flag + sentinel + tier + stream_position
        let mut payload: Vec<u8> = Vec::with_capacity(4 + 1 + 1 + 1 + 8);
        write_len_le(&mut payload, cfg.top_n)?;
        write_u8(&mut payload, cfg.capture_snapshots as u8)?;
        write_u8(&mut payload, sentinel_code(cfg.sentinel))?;
        write_u8(&mut payload, tier_code(cfg.execution_tier))?;
        write_u64_le(&mut payload, self.stream_position())?;
        write_chunk_lz4(w, *b"CNFG", &payload)
    }

    fn read_cfg_payload<R: Read>(r: &mut R) -> io::Result<SavedConfig> {
        let top_n = read_u32_le(r)? as usize;
        let capture_snapshots = read_u8(r)? != 0;
        let sentinel = sentinel_from_code(read_u8(r)?)?;
        let execution_tier = tier_from_code(read_u8(r)?)?;
        let stream_position = read_u64_le(r)?;
        let config = SearchConfig {
            top_n,
            capture_snapshots,
            sentinel,
            execution_tier,
        };
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(SavedConfig {
            config,
            stream_position,
        })
    }

    fn write_outputs_chunk<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut payload: Vec<u8> = Vec::new();
        write_len_le(&mut payload, self.records().len())?;
        for record in self.records() {
            write_string(&mut payload, record.output())?;
            let (kind, units, height, width) = match record.dims() {
                OutputDims::Dense { units } => (0u8, units, 0, 0),
                OutputDims::Spatial {
                    units,
                    height,
                    width,
                } => (1u8, units, height, width),
            };
            write_u8(&mut payload, kind)?;
            write_len_le(&mut payload, units)?;
            write_len_le(&mut payload, height)?;
            write_len_le(&mut payload, width)?;
        }
        write_chunk_lz4(w, *b"OUTS", &payload)
    }

    fn read_outputs_payload<R: Read>(r: &mut R) -> io::Result<Vec<(String, OutputDims)>> {
        let count = read_u32_le(r)? as usize;
        let mut outs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = read_string(r)?;
            let kind = read_u8(r)?;
            let units = read_u32_le(r)? as usize;
            let height = read_u32_le(r)? as usize;
            let width = read_u32_le(r)? as usize;
            let dims = match kind {
                0 => OutputDims::dense(units),
                1 => OutputDims::spatial(units, height, width),
                _ => return Err(invalid("unknown output kind")),
            };
            if dims.has_empty_axis() {
                return Err(invalid("empty output dims"));
            }
            outs.push((name, dims));
        }
        Ok(outs)
    }

    fn write_record_chunk<W: Write>(
        w: &mut W,
        index: usize,
        record: &StatisticsRecord,
    ) -> io::Result<()> {
        let snapshot_len = record.snapshot().map_or(0, |s| s.len());
        let mut payload: Vec<u8> = Vec::with_capacity(
            4 + record.quantities().len() * 4
                + record.indices().len() * 8
                + 1
                + snapshot_len * 4,
        );
        write_len_le(&mut payload, index)?;
        for &q in record.quantities().as_slice() {
            write_f32_le(&mut payload, q)?;
        }
        for &i in record.indices().as_slice() {
            write_u64_le(&mut payload, i)?;
        }
        match record.snapshot() {
            Some(snapshot) => {
                write_u8(&mut payload, 1)?;
                for &v in snapshot.as_slice() {
                    write_f32_le(&mut payload, v)?;
                }
            }
            None => write_u8(&mut payload, 0)?,
        }
        write_chunk_lz4(w, *b"RECD", &payload)
    }

    fn read_record_payload(
        cursor: &mut io::Cursor<Vec<u8>>,
        dims: OutputDims,
        top_n: usize,
    ) -> io::Result<SavedBuffers> {
        if dims.max_buffer_bytes(top_n, false).is_none() {
            return Err(invalid("record buffers too large"));
        }
        let quantities = read_f32_tensor(cursor, &[top_n, dims.units()])?;
        let index_shape = match dims {
            OutputDims::Dense { units } => vec![top_n, units],
            OutputDims::Spatial { units, .. } => vec![top_n, units, dims.coordinate_arity()],
        };
        let indices = read_u64_tensor(cursor, &index_shape)?;
        let snapshot = match read_u8(cursor)? {
            0 => None,
            1 if dims.is_spatial() => {
                if dims.max_buffer_bytes(top_n, true).is_none() {
                    return Err(invalid("record buffers too large"));
                }
                let mut shape = vec![top_n];
                shape.extend(dims.feature_shape());
                Some(read_f32_tensor(cursor, &shape)?)
            }
            _ => return Err(invalid("bad snapshot flag")),
        };
        Ok(SavedBuffers {
            quantities,
            indices,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ActivationBatch, MonitoredOutput};

    fn populated() -> MaximumActivationSearch {
        let mut search = MaximumActivationSearch::new(
            vec![
                MonitoredOutput::dense("fc", 3),
                MonitoredOutput::spatial("conv", 2, 2, 3),
            ],
            &(),
            SearchConfig::default()
                .with_top_n(4)
                .with_sentinel(SentinelPolicy::NegativeInfinity),
        )
        .unwrap();
        for step in 0..3 {
            let fc = Tensor::from_vec(
                &[2, 3],
                (0..6).map(|i| ((i * 7 + step * 3) % 11) as f32 - 4.0).collect(),
            )
            .unwrap();
            let conv = Tensor::from_vec(
                &[2, 2, 2, 3],
                (0..24).map(|i| ((i * 5 + step) % 13) as f32 * 0.5).collect(),
            )
            .unwrap();
            search
                .step(&ActivationBatch::new().with("fc", &fc).with("conv", &conv))
                .unwrap();
        }
        search
    }

    #[test]
    fn image_roundtrip_preserves_state() {
        let search = populated();
        let bytes = search.save_image_bytes().unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(search.image_size_bytes().unwrap(), bytes.len());

        let loaded = MaximumActivationSearch::load_image_bytes(&bytes).unwrap();
        assert_eq!(loaded.config(), search.config());
        assert_eq!(loaded.stream_position(), 6);
        for (a, b) in search.records().iter().zip(loaded.records()) {
            assert_eq!(a.output(), b.output());
            assert_eq!(a.dims(), b.dims());
            assert_eq!(a.quantities(), b.quantities());
            assert_eq!(a.indices(), b.indices());
            assert_eq!(a.snapshot(), b.snapshot());
        }
    }

    #[test]
    fn loaded_search_keeps_streaming() {
        let mut original = populated();
        let mut loaded =
            MaximumActivationSearch::load_image_bytes(&original.save_image_bytes().unwrap())
                .unwrap();

        let fc = Tensor::from_vec(&[1, 3], vec![100.0, -1.0, 3.5]).unwrap();
        let conv = Tensor::<f32>::filled(&[1, 2, 2, 3], 50.0);
        let batch = ActivationBatch::new().with("fc", &fc).with("conv", &conv);
        original.step(&batch).unwrap();
        loaded.step(&batch).unwrap();

        assert_eq!(loaded.stream_position(), original.stream_position());
        assert_eq!(
            loaded.record("fc").unwrap().quantities(),
            original.record("fc").unwrap().quantities()
        );
        assert_eq!(loaded.record("fc").unwrap().coordinate(0, 0).unwrap().example, 6);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = populated().save_image_bytes().unwrap();
        bytes[0] = b'X';
        let err = MaximumActivationSearch::load_image_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bytes = populated().save_image_bytes().unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        let err = MaximumActivationSearch::load_image_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_missing_records() {
        let search = populated();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        write_u32_le(&mut bytes, VERSION_CURRENT).unwrap();
        search.write_cfg_chunk(&mut bytes).unwrap();
        search.write_outputs_chunk(&mut bytes).unwrap();
        let err = MaximumActivationSearch::load_image_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_unaddressable_record_dims() {
        let mut cfg = Vec::new();
        write_len_le(&mut cfg, 16).unwrap();
        write_u8(&mut cfg, 1).unwrap();
        write_u8(&mut cfg, sentinel_code(SentinelPolicy::Zero)).unwrap();
        write_u8(&mut cfg, tier_code(ExecutionTier::Scalar)).unwrap();
        write_u64_le(&mut cfg, 0).unwrap();

        let mut outs = Vec::new();
        write_len_le(&mut outs, 1).unwrap();
        write_string(&mut outs, "c").unwrap();
        write_u8(&mut outs, 1).unwrap();
        for d in [1usize, 1 << 30, 1 << 30] {
            write_len_le(&mut outs, d).unwrap();
        }

        let mut recd = Vec::new();
        write_len_le(&mut recd, 0).unwrap();
        for _ in 0..16 {
            write_f32_le(&mut recd, 0.0).unwrap();
        }
        for _ in 0..16 * 3 {
            write_u64_le(&mut recd, 0).unwrap();
        }
        write_u8(&mut recd, 1).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        write_u32_le(&mut bytes, VERSION_CURRENT).unwrap();
        write_chunk_lz4(&mut bytes, *b"CNFG", &cfg).unwrap();
        write_chunk_lz4(&mut bytes, *b"OUTS", &outs).unwrap();
        write_chunk_lz4(&mut bytes, *b"RECD", &recd).unwrap();

        let err = MaximumActivationSearch::load_image_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_tensor_shape_is_invalid_data() {
        let mut cursor = io::Cursor::new(vec![0u8; 16]);
        let err = read_f32_tensor(&mut cursor, &[16, 1, 1 << 30, 1 << 30]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = read_u64_tensor(&mut cursor, &[usize::MAX, 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn skips_unknown_chunks() {
        let search = populated();
        let mut bytes = search.save_image_bytes().unwrap();
        write_chunk_lz4(&mut bytes, *b"XTRA", b"ignored payload").unwrap();
        let loaded = MaximumActivationSearch::load_image_bytes(&bytes).unwrap();
        assert_eq!(loaded.stream_position(), search.stream_position());
    }
}
