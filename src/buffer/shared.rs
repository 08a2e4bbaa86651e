//! Cross-process shared ring buffer
//!
//! A memory-mapped region made of a fixed header followed by
//! `total_frames × bytes_per_frame` bytes of sample data. The producer side
//! owns the write cursor, the consumer side owns the read cursor; both are
//! absolute frame numbers that only ever move forward by a delta. The data
//! region is never handed out as a slice, only copied in and out of.

use std::fs::OpenOptions;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_SHARED_BUFFER_BYTES;
use crate::error::BufferError;

pub const SHM_MAGIC: u32 = 0x4153_5242; // "ASRB"
pub const SHM_VERSION: u32 = 1;

const HANDLE_READ_RETRIES: usize = 64;

/// Frame geometry negotiated once per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferGeometry {
    pub total_frames: u32,
    pub span_frames: u32,
    pub bytes_per_frame: u32,
}

impl BufferGeometry {
    pub fn new(total_frames: u32, span_frames: u32, bytes_per_frame: u32) -> Self {
        Self {
            total_frames,
            span_frames,
            bytes_per_frame,
        }
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if self.total_frames == 0 || self.span_frames == 0 || self.bytes_per_frame == 0 {
            return Err(BufferError::InvalidGeometry(format!("zero size in {self:?}")));
        }
        if self.total_frames % self.span_frames != 0 {
            return Err(BufferError::InvalidGeometry(format!(
                "total {} is not a multiple of span {}",
                self.total_frames, self.span_frames
            )));
        }
        if self.data_bytes() as u64 > MAX_SHARED_BUFFER_BYTES {
            return Err(BufferError::InvalidGeometry(format!(
                "{} bytes exceeds limit",
                self.data_bytes()
            )));
        }
        Ok(())
    }

    pub fn span_bytes(&self) -> usize {
        self.span_frames as usize * self.bytes_per_frame as usize
    }

    pub fn data_bytes(&self) -> usize {
        self.total_frames as usize * self.bytes_per_frame as usize
    }

    pub fn span_count(&self) -> u32 {
        self.total_frames / self.span_frames.max(1)
    }
}

/// Last position the consumer reported as handled, with its wall-clock time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub frame_position: u64,
    pub timestamp_ns: i64,
}

#[repr(C)]
struct RingHeader {
    magic: u32,
    version: u32,
    total_frames: u32,
    span_frames: u32,
    bytes_per_frame: u32,
    _reserved: u32,
    write_frame: AtomicU64,
    read_frame: AtomicU64,
    handle_seq: AtomicU64,
    handle_frame: AtomicU64,
    handle_time_ns: AtomicI64,
}

fn header_size() -> usize {
    mem::size_of::<RingHeader>()
}

fn map_err(err: std::io::Error) -> BufferError {
    BufferError::Map(err.to_string())
}

pub struct SharedRingBuffer {
    map: MmapMut,
    geometry: BufferGeometry,
    path: Option<PathBuf>,
    owns_file: bool,
}

impl SharedRingBuffer {
    /// Map a private anonymous region (both sides live in this process).
    pub fn create_anonymous(geometry: BufferGeometry) -> Result<Self, BufferError> {
        geometry.validate()?;
        let mut map = MmapOptions::new()
            .len(header_size() + geometry.data_bytes())
            .map_anon()
            .map_err(map_err)?;
        Self::init_header(&mut map, geometry);
        Ok(Self {
            map,
            geometry,
            path: None,
            owns_file: false,
        })
    }

    /// Create a file-backed region another process can `open`. The file is
    /// removed when this handle is dropped.
    pub fn create(path: &Path, geometry: BufferGeometry) -> Result<Self, BufferError> {
        geometry.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(map_err)?;
        file.set_len((header_size() + geometry.data_bytes()) as u64)
            .map_err(map_err)?;

        // SAFETY: the file was just created by us with create_new and sized
        // above; nothing else maps it yet.
        let mut map = unsafe { MmapOptions::new().map_mut(&file).map_err(map_err)? };
        Self::init_header(&mut map, geometry);
        Ok(Self {
            map,
            geometry,
            path: Some(path.to_path_buf()),
            owns_file: true,
        })
    }

    /// Map a region created by the other side and check its header.
    pub fn open(path: &Path) -> Result<Self, BufferError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(map_err)?;
        // SAFETY: the peer only mutates the region through the atomic header
        // fields and the span protocol enforced by this type.
        let map = unsafe { MmapOptions::new().map_mut(&file).map_err(map_err)? };
        if map.len() < header_size() {
            return Err(BufferError::HeaderMismatch("region smaller than header".into()));
        }
        // SAFETY: length checked above; mmap is page aligned.
        let header = unsafe { &*(map.as_ptr() as *const RingHeader) };
        if header.magic != SHM_MAGIC || header.version != SHM_VERSION {
            return Err(BufferError::HeaderMismatch(format!(
                "magic {:#x} version {}",
                header.magic, header.version
            )));
        }
        let geometry = BufferGeometry::new(
            header.total_frames,
            header.span_frames,
            header.bytes_per_frame,
        );
        geometry.validate()?;
        if map.len() != header_size() + geometry.data_bytes() {
            return Err(BufferError::HeaderMismatch(format!(
                "region is {} bytes, geometry needs {}",
                map.len(),
                header_size() + geometry.data_bytes()
            )));
        }
        Ok(Self {
            map,
            geometry,
            path: Some(path.to_path_buf()),
            owns_file: false,
        })
    }

    fn init_header(map: &mut MmapMut, geometry: BufferGeometry) {
        // SAFETY: the map is at least header_size() long and exclusively
        // borrowed here.
        unsafe {
            ptr::write(
                map.as_mut_ptr() as *mut RingHeader,
                RingHeader {
                    magic: SHM_MAGIC,
                    version: SHM_VERSION,
                    total_frames: geometry.total_frames,
                    span_frames: geometry.span_frames,
                    bytes_per_frame: geometry.bytes_per_frame,
                    _reserved: 0,
                    write_frame: AtomicU64::new(0),
                    read_frame: AtomicU64::new(0),
                    handle_seq: AtomicU64::new(0),
                    handle_frame: AtomicU64::new(0),
                    handle_time_ns: AtomicI64::new(0),
                },
            );
            ptr::write_bytes(
                map.as_mut_ptr().add(header_size()),
                0,
                geometry.data_bytes(),
            );
        }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: every constructor guarantees a valid header at offset 0.
        unsafe { &*(self.map.as_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the data region starts right after the header.
        unsafe { (self.map.as_ptr() as *mut u8).add(header_size()) }
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn total_frames(&self) -> u32 {
        self.geometry.total_frames
    }

    pub fn span_frames(&self) -> u32 {
        self.geometry.span_frames
    }

    pub fn bytes_per_frame(&self) -> u32 {
        self.geometry.bytes_per_frame
    }

    pub fn span_bytes(&self) -> usize {
        self.geometry.span_bytes()
    }

    /// Backing file, if the region is shareable with another process
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cur_write_frame(&self) -> u64 {
        self.header().write_frame.load(Ordering::Acquire)
    }

    pub fn cur_read_frame(&self) -> u64 {
        self.header().read_frame.load(Ordering::Acquire)
    }

    /// Frames written but not yet read
    pub fn available_data_frames(&self) -> u64 {
        let read = self.cur_read_frame();
        let write = self.cur_write_frame();
        write.saturating_sub(read)
    }

    /// Frames the producer may still write without overrunning the reader
    pub fn writable_frames(&self) -> u64 {
        (self.geometry.total_frames as u64).saturating_sub(self.available_data_frames())
    }

    /// Move the write cursor forward. Producer side only.
    pub fn advance_write(&self, delta: u64) -> Result<u64, BufferError> {
        let writable = self.writable_frames();
        if delta > writable {
            return Err(BufferError::AdvanceOverflow {
                delta,
                limit: writable,
            });
        }
        Ok(self.header().write_frame.fetch_add(delta, Ordering::AcqRel) + delta)
    }

    /// Move the read cursor forward. Consumer side only.
    pub fn advance_read(&self, delta: u64) -> Result<u64, BufferError> {
        let available = self.available_data_frames();
        if delta > available {
            return Err(BufferError::AdvanceOverflow {
                delta,
                limit: available,
            });
        }
        Ok(self.header().read_frame.fetch_add(delta, Ordering::AcqRel) + delta)
    }

    fn frames_of(&self, len: usize) -> Result<u64, BufferError> {
        let bpf = self.geometry.bytes_per_frame as usize;
        if bpf == 0 || len % bpf != 0 {
            return Err(BufferError::UnalignedLength(len));
        }
        Ok((len / bpf) as u64)
    }

    /// Copy `data` into the region starting at absolute frame `frame`.
    /// The range must lie within `read .. read + total`.
    pub fn write_span(&self, frame: u64, data: &[u8]) -> Result<(), BufferError> {
        let frames = self.frames_of(data.len())?;
        let low = self.cur_read_frame();
        let high = low + self.geometry.total_frames as u64;
        if frame < low || frame + frames > high {
            return Err(BufferError::OutOfRange {
                start: frame,
                end: frame + frames,
                low,
                high,
            });
        }
        let (offset, first) = self.split(frame, data.len());
        // SAFETY: offset + first and the wrapped remainder both lie inside
        // the data region; the cursor check above keeps the reader off it.
        unsafe {
            let base = self.data_ptr();
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), first);
            if first < data.len() {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
            }
        }
        Ok(())
    }

    /// Copy frames starting at absolute frame `frame` into `out`.
    /// The range must lie within `read .. write`.
    pub fn read_span(&self, frame: u64, out: &mut [u8]) -> Result<(), BufferError> {
        let frames = self.frames_of(out.len())?;
        let low = self.cur_read_frame();
        let high = self.cur_write_frame();
        if frame < low || frame + frames > high {
            return Err(BufferError::OutOfRange {
                start: frame,
                end: frame + frames,
                low,
                high,
            });
        }
        let (offset, first) = self.split(frame, out.len());
        // SAFETY: see write_span; the range is below the write cursor so the
        // writer is not touching it.
        unsafe {
            let base = self.data_ptr() as *const u8;
            ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), first);
            if first < out.len() {
                ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
        Ok(())
    }

    /// Byte offset for `frame` and the length that fits before the wrap
    fn split(&self, frame: u64, len: usize) -> (usize, usize) {
        let total = self.geometry.total_frames as u64;
        let offset = (frame % total) as usize * self.geometry.bytes_per_frame as usize;
        let first = len.min(self.geometry.data_bytes() - offset);
        (offset, first)
    }

    /// Publish the consumer's handled position. Consumer side only.
    pub fn set_handle_info(&self, frame_position: u64, timestamp_ns: i64) {
        let header = self.header();
        header.handle_seq.fetch_add(1, Ordering::AcqRel);
        header.handle_frame.store(frame_position, Ordering::Release);
        header.handle_time_ns.store(timestamp_ns, Ordering::Release);
        header.handle_seq.fetch_add(1, Ordering::Release);
    }

    pub fn handle_info(&self) -> HandleInfo {
        let header = self.header();
        let mut info = HandleInfo::default();
        for _ in 0..HANDLE_READ_RETRIES {
            let before = header.handle_seq.load(Ordering::Acquire);
            info.frame_position = header.handle_frame.load(Ordering::Acquire);
            info.timestamp_ns = header.handle_time_ns.load(Ordering::Acquire);
            fence(Ordering::Acquire);
            let after = header.handle_seq.load(Ordering::Acquire);
            if before == after && before % 2 == 0 {
                break;
            }
            std::hint::spin_loop();
        }
        info
    }
}

impl std::fmt::Debug for SharedRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRingBuffer")
            .field("geometry", &self.geometry)
            .field("write_frame", &self.cur_write_frame())
            .field("read_frame", &self.cur_read_frame())
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for SharedRingBuffer {
    fn drop(&mut self) {
        if self.owns_file {
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
