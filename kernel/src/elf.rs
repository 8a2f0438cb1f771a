//! ELF32 i386 executables: header validation and the list of loadable segments.
//!
//! Headers are copied out of the image into goblin's `elf32` structs, so misaligned input
//! cannot fault and short input is reported as truncated.

use crate::config::{MAX_IMAGE_SEGMENTS, PAGE_SIZE, USER_BASE, USER_LIMIT, USER_STACK_SIZE};
use crate::util::checked_align_up;
use core::fmt;
use plain::Plain;
use goblin::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS32, ELFDATA2LSB, ELFMAG, EM_386, ET_EXEC, SELFMAG,
};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf32::header::{Header, SIZEOF_EHDR};
use goblin::elf32::program_header::{ProgramHeader, SIZEOF_PHDR};
use tinyvec::ArrayVec;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = PF_X;
        const WRITE = PF_W;
        const READ = PF_R;
    }
}

/// A program header describing bytes to place in memory
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LoadSegment {
    /// Program header type; only `PT_LOAD` is accepted
    pub kind: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub file_size: u32,
    /// Bytes past `file_size` up to this are zero filled
    pub mem_size: u32,
    pub flags: SegmentFlags,
}

impl LoadSegment {
    /// A `PT_LOAD` segment
    pub fn new(offset: u32, vaddr: u32, file_size: u32, mem_size: u32, flags: SegmentFlags) -> Self {
        LoadSegment {
            kind: PT_LOAD,
            offset,
            vaddr,
            file_size,
            mem_size,
            flags,
        }
    }

    /// Exclusive end of the segment in memory
    pub fn end(&self) -> u32 {
        self.vaddr + self.mem_size
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(SegmentFlags::WRITE)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageError {
    /// Shorter than its headers claim
    Truncated,
    BadMagic,
    /// Not a little-endian, 32-bit, i386 executable
    Unsupported,
    TooManySegments,
    /// A segment other than `PT_LOAD` was given to the loader
    NotLoadable(u32),
    /// File size larger than memory size
    InconsistentSizes { vaddr: u32 },
    OutsideUserWindow { vaddr: u32 },
    EntryOutsideImage(u32),
}

impl ImageError {
    pub fn description(&self) -> &'static str {
        match self {
            ImageError::Truncated => "image truncated",
            ImageError::BadMagic => "bad ELF magic",
            ImageError::Unsupported => "not a 32-bit little-endian i386 executable",
            ImageError::TooManySegments => "too many loadable segments",
            ImageError::NotLoadable(_) => "segment is not loadable",
            ImageError::InconsistentSizes { .. } => "segment file size exceeds memory size",
            ImageError::OutsideUserWindow { .. } => "segment outside the user window",
            ImageError::EntryOutsideImage(_) => "entry point outside the image",
        }
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageError::NotLoadable(kind) => write!(f, "{} (type {})", self.description(), kind),
            ImageError::InconsistentSizes { vaddr } | ImageError::OutsideUserWindow { vaddr } => {
                write!(f, "{} at 0x{:x}", self.description(), vaddr)
            }
            ImageError::EntryOutsideImage(entry) => {
                write!(f, "{} (0x{:x})", self.description(), entry)
            }
            _ => f.write_str(self.description()),
        }
    }
}

/// A validated executable image
#[derive(Debug, Clone)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    entry: u32,
    segments: ArrayVec<[LoadSegment; MAX_IMAGE_SEGMENTS]>,
}

impl<'a> ElfImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ImageError> {
        let header: Header = copy_header(data)?;

        if &header.e_ident[..SELFMAG] != ELFMAG {
            return Err(ImageError::BadMagic);
        }

        if header.e_ident[EI_CLASS] != ELFCLASS32
            || header.e_ident[EI_DATA] != ELFDATA2LSB
            || header.e_type != ET_EXEC
            || header.e_machine != EM_386
            || header.e_phentsize as usize != SIZEOF_PHDR
        {
            return Err(ImageError::Unsupported);
        }

        let mut segments = ArrayVec::new();
        for index in 0..header.e_phnum as usize {
            let start = index
                .checked_mul(SIZEOF_PHDR)
                .and_then(|offset| offset.checked_add(header.e_phoff as usize))
                .ok_or(ImageError::Truncated)?;
            let program_header: ProgramHeader =
                copy_header(data.get(start..).ok_or(ImageError::Truncated)?)?;

            if program_header.p_type != PT_LOAD {
                continue;
            }

            if segments.len() == segments.capacity() {
                return Err(ImageError::TooManySegments);
            }
            segments.push(LoadSegment::from(program_header));
        }

        Self::validated(data, header.e_entry, segments)
    }

    /// An image from program headers parsed elsewhere
    pub fn from_segments(
        data: &'a [u8],
        entry: u32,
        segments: &[LoadSegment],
    ) -> Result<Self, ImageError> {
        if segments.len() > MAX_IMAGE_SEGMENTS {
            return Err(ImageError::TooManySegments);
        }

        let mut list = ArrayVec::new();
        list.extend_from_slice(segments);
        Self::validated(data, entry, list)
    }

    fn validated(
        data: &'a [u8],
        entry: u32,
        segments: ArrayVec<[LoadSegment; MAX_IMAGE_SEGMENTS]>,
    ) -> Result<Self, ImageError> {
        for segment in &segments {
            validate_segment(segment, data.len())?;
        }

        let image = ElfImage {
            data,
            entry,
            segments,
        };

        let stack_top = USER_BASE as u64 + image.memory_size_unchecked();
        if stack_top > USER_LIMIT as u64 {
            return Err(ImageError::OutsideUserWindow {
                vaddr: image.image_end(),
            });
        }

        if entry < USER_BASE || entry >= image.image_end() {
            return Err(ImageError::EntryOutsideImage(entry));
        }

        Ok(image)
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    /// The bytes of `segment` present in the file
    pub fn file_bytes(&self, segment: &LoadSegment) -> &'a [u8] {
        let start = segment.offset as usize;
        &self.data[start..start + segment.file_size as usize]
    }

    /// Bytes of process memory the image needs from [USER_BASE]: every segment, page rounded,
    /// followed by the user stack
    pub fn memory_size(&self) -> u32 {
        self.memory_size_unchecked() as u32
    }

    /// Initial user stack pointer
    pub fn stack_top(&self) -> u32 {
        USER_BASE + self.memory_size()
    }

    fn image_end(&self) -> u32 {
        self.segments
            .iter()
            .map(LoadSegment::end)
            .max()
            .unwrap_or(USER_BASE)
    }

    fn memory_size_unchecked(&self) -> u64 {
        let used = self.image_end() - USER_BASE;
        let rounded = checked_align_up(used, PAGE_SIZE).unwrap_or(u32::MAX);
        u64::from(rounded) + u64::from(USER_STACK_SIZE)
    }
}

/// Reject a segment before anything is mapped for it
pub fn validate_segment(segment: &LoadSegment, data_len: usize) -> Result<(), ImageError> {
    if segment.kind != PT_LOAD {
        return Err(ImageError::NotLoadable(segment.kind));
    }

    if segment.file_size > segment.mem_size {
        return Err(ImageError::InconsistentSizes {
            vaddr: segment.vaddr,
        });
    }

    match (segment.offset as usize).checked_add(segment.file_size as usize) {
        Some(end) if end <= data_len => (),
        _ => return Err(ImageError::Truncated),
    }

    let in_window = segment.vaddr >= USER_BASE
        && segment
            .vaddr
            .checked_add(segment.mem_size)
            .map_or(false, |end| end <= USER_LIMIT);

    if !in_window {
        return Err(ImageError::OutsideUserWindow {
            vaddr: segment.vaddr,
        });
    }

    Ok(())
}

impl From<ProgramHeader> for LoadSegment {
    fn from(header: ProgramHeader) -> Self {
        LoadSegment {
            kind: header.p_type,
            offset: header.p_offset,
            vaddr: header.p_vaddr,
            file_size: header.p_filesz,
            mem_size: header.p_memsz,
            flags: SegmentFlags::from_bits_truncate(header.p_flags),
        }
    }
}

/// Copy a header out of the front of `data`
fn copy_header<T: Plain + Default>(data: &[u8]) -> Result<T, ImageError> {
    let mut header = T::default();
    plain::copy_from_bytes(&mut header, data).map_err(|_| ImageError::Truncated)?;
    Ok(header)
}
