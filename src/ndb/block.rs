//! [Blocks](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/a9c1981d-d1ea-457c-b39e-dc7fb0eb95d4)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use super::*;
use crate::{
    crc::compute_crc,
    encode::{cyclic, permute},
    AnsiPstFile, PstFile, UnicodePstFile,
};

pub const MAX_BLOCK_SIZE: u16 = 8192;

pub const fn block_size(size: u16) -> u16 {
    if size >= MAX_BLOCK_SIZE {
        MAX_BLOCK_SIZE
    } else {
        let size = if size < 64 { 64 } else { size };
        let tail = size % 64;
        if tail == 0 {
            size
        } else {
            size - tail + 64
        }
    }
}

/// [BLOCKTRAILER](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/a14943ef-70c2-403f-898c-5bc3747117e1)
pub trait BlockTrailer: Sized {
    type BlockId: BlockId;
    const SIZE: u16;

    fn new(size: u16, signature: u16, crc: u32, block_id: Self::BlockId) -> NdbResult<Self>;
    fn read(f: &mut dyn Read) -> io::Result<Self>;
    fn write(&self, f: &mut dyn Write) -> io::Result<()>;
    fn size(&self) -> u16;
    fn signature(&self) -> u16;
    fn crc(&self) -> u32;
    fn block_id(&self) -> Self::BlockId;
    fn cyclic_key(&self) -> u32;

    fn verify_block_id(&self, is_internal: bool) -> NdbResult<()> {
        if self.block_id().is_internal() == is_internal {
            Ok(())
        } else {
            Err(NdbError::InvalidInternalBlockType(is_internal as u8))
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct UnicodeBlockTrailer {
    size: u16,
    signature: u16,
    crc: u32,
    block_id: UnicodeBlockId,
}

impl BlockTrailer for UnicodeBlockTrailer {
    type BlockId = UnicodeBlockId;
    const SIZE: u16 = 16;

    fn new(size: u16, signature: u16, crc: u32, block_id: UnicodeBlockId) -> NdbResult<Self> {
        if !(1..=(MAX_BLOCK_SIZE - Self::SIZE)).contains(&size) {
            return Err(NdbError::InvalidBlockSize(size));
        }

        Ok(Self {
            size,
            block_id,
            signature,
            crc,
        })
    }

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let size = f.read_u16::<LittleEndian>()?;
        if !(1..=(MAX_BLOCK_SIZE - Self::SIZE)).contains(&size) {
            return Err(NdbError::InvalidBlockSize(size).into());
        }

        let signature = f.read_u16::<LittleEndian>()?;
        let crc = f.read_u32::<LittleEndian>()?;
        let block_id = UnicodeBlockId::read(f)?;

        Ok(Self {
            size,
            signature,
            crc,
            block_id,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(self.size)?;
        f.write_u16::<LittleEndian>(self.signature)?;
        f.write_u32::<LittleEndian>(self.crc)?;
        self.block_id.write(f)
    }

    fn size(&self) -> u16 {
        self.size
    }

    fn signature(&self) -> u16 {
        self.signature
    }

    fn crc(&self) -> u32 {
        self.crc
    }

    fn block_id(&self) -> UnicodeBlockId {
        self.block_id
    }

    fn cyclic_key(&self) -> u32 {
        u64::from(self.block_id) as u32
    }
}

impl BlockTrailerReadWrite for UnicodeBlockTrailer {
    const SIZE: u16 = <Self as BlockTrailer>::SIZE;

    fn new(size: u16, signature: u16, crc: u32, block_id: UnicodeBlockId) -> NdbResult<Self> {
        <Self as BlockTrailer>::new(size, signature, crc, block_id)
    }

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        <Self as BlockTrailer>::read(f)
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        <Self as BlockTrailer>::write(self, f)
    }
}

#[derive(Clone, Copy, Default)]
pub struct AnsiBlockTrailer {
    size: u16,
    signature: u16,
    block_id: AnsiBlockId,
    crc: u32,
}

impl BlockTrailer for AnsiBlockTrailer {
    type BlockId = AnsiBlockId;
    const SIZE: u16 = 12;

    fn new(size: u16, signature: u16, crc: u32, block_id: AnsiBlockId) -> NdbResult<Self> {
        if !(1..=(MAX_BLOCK_SIZE - Self::SIZE)).contains(&size) {
            return Err(NdbError::InvalidBlockSize(size));
        }

        Ok(Self {
            size,
            signature,
            block_id,
            crc,
        })
    }

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let size = f.read_u16::<LittleEndian>()?;
        if !(1..=(MAX_BLOCK_SIZE - Self::SIZE)).contains(&size) {
            return Err(NdbError::InvalidBlockSize(size).into());
        }

        let signature = f.read_u16::<LittleEndian>()?;
        let block_id = AnsiBlockId::read(f)?;
        let crc = f.read_u32::<LittleEndian>()?;

        Ok(Self {
            size,
            signature,
            block_id,
            crc,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(self.size)?;
        f.write_u16::<LittleEndian>(self.signature)?;
        self.block_id.write(f)?;
        f.write_u32::<LittleEndian>(self.crc)
    }

    fn size(&self) -> u16 {
        self.size
    }

    fn signature(&self) -> u16 {
        self.signature
    }

    fn crc(&self) -> u32 {
        self.crc
    }

    fn block_id(&self) -> AnsiBlockId {
        self.block_id
    }

    fn cyclic_key(&self) -> u32 {
        u32::from(self.block_id)
    }
}

impl BlockTrailerReadWrite for AnsiBlockTrailer {
    const SIZE: u16 = <Self as BlockTrailer>::SIZE;

    fn new(size: u16, signature: u16, crc: u32, block_id: AnsiBlockId) -> NdbResult<Self> {
        <Self as BlockTrailer>::new(size, signature, crc, block_id)
    }

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        <Self as BlockTrailer>::read(f)
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        <Self as BlockTrailer>::write(self, f)
    }
}

/// [Data Blocks](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/d0e6fbaf-00e3-4d4d-bea8-8ab3cdb4fde6)
pub trait Block: Sized {
    type Trailer: BlockTrailer;

    fn new(encoding: NdbCryptMethod, data: Vec<u8>, trailer: Self::Trailer) -> NdbResult<Self>;

    fn read<R: Read + Seek>(f: &mut R, size: u16, encoding: NdbCryptMethod) -> io::Result<Self> {
        let mut data = vec![0; size as usize];
        f.read_exact(&mut data)?;

        let offset = i64::from(block_size(size) - size - Self::Trailer::SIZE);
        if offset > 0 {
            f.seek(SeekFrom::Current(offset))?;
        }

        let trailer = Self::Trailer::read(f)?;
        if trailer.size() != size {
            return Err(NdbError::InvalidBlockSize(trailer.size()).into());
        }
        let crc = compute_crc(0, &data);
        if crc != trailer.crc() {
            return Err(NdbError::InvalidBlockCrc(crc).into());
        }

        match encoding {
            NdbCryptMethod::Cyclic => {
                let key = trailer.cyclic_key();
                cyclic::encode_decode_block(&mut data, key);
            }
            NdbCryptMethod::Permute => {
                permute::decode_block(&mut data);
            }
            _ => {}
        }

        Ok(Self::new(encoding, data, trailer)?)
    }

    fn write<W: Write + Seek>(&self, f: &mut W) -> io::Result<()> {
        let mut data = self.data().to_vec();
        let trailer = self.trailer();

        match self.encoding() {
            NdbCryptMethod::Cyclic => {
                let key = trailer.cyclic_key();
                cyclic::encode_decode_block(&mut data, key);
            }
            NdbCryptMethod::Permute => {
                permute::encode_block(&mut data);
            }
            _ => {}
        }

        let crc = compute_crc(0, &data);
        let trailer = Self::Trailer::new(
            data.len() as u16,
            trailer.signature(),
            crc,
            trailer.block_id(),
        )?;

        f.write_all(&data)?;

        let size = data.len() as u16;
        let offset = i64::from(block_size(size) - size - UnicodeBlockTrailer::SIZE);
        if offset > 0 {
            f.seek(SeekFrom::Current(offset))?;
        }

        trailer.write(f)
    }

    fn encoding(&self) -> NdbCryptMethod;
    fn data(&self) -> &[u8];
    fn trailer(&self) -> &Self::Trailer;
}

#[derive(Clone, Default)]
pub struct UnicodeDataBlock {
    encoding: NdbCryptMethod,
    data: Vec<u8>,
    trailer: UnicodeBlockTrailer,
}

impl Block for UnicodeDataBlock {
    type Trailer = UnicodeBlockTrailer;

    fn new(
        encoding: NdbCryptMethod,
        data: Vec<u8>,
        trailer: UnicodeBlockTrailer,
    ) -> NdbResult<Self> {
        let block_id = trailer.block_id();
        if block_id.is_internal() {
            return Err(NdbError::InvalidUnicodeBlockTrailerId(u64::from(block_id)));
        }

        Ok(Self {
            data,
            encoding,
            trailer,
        })
    }

    fn encoding(&self) -> NdbCryptMethod {
        self.encoding
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn trailer(&self) -> &UnicodeBlockTrailer {
        &self.trailer
    }
}

#[derive(Clone, Default)]
pub struct AnsiDataBlock {
    encoding: NdbCryptMethod,
    data: Vec<u8>,
    trailer: AnsiBlockTrailer,
}

impl Block for AnsiDataBlock {
    type Trailer = AnsiBlockTrailer;

    fn new(encoding: NdbCryptMethod, data: Vec<u8>, trailer: AnsiBlockTrailer) -> NdbResult<Self> {
        let block_id = trailer.block_id();
        if block_id.is_internal() {
            return Err(NdbError::InvalidAnsiBlockTrailerId(u32::from(block_id)));
        }

        Ok(Self {
            data,
            encoding,
            trailer,
        })
    }

    fn encoding(&self) -> NdbCryptMethod {
        self.encoding
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn trailer(&self) -> &AnsiBlockTrailer {
        &self.trailer
    }
}

impl<T> BlockReadWrite for T
where
    T: Block,
    <T as Block>::Trailer: BlockTrailerReadWrite,
    u64: From<<<<T as Block>::Trailer as BlockTrailer>::BlockId as BlockId>::Index>,
{
    fn new(encoding: NdbCryptMethod, data: Vec<u8>, trailer: Self::Trailer) -> NdbResult<Self> {
        <Self as Block>::new(encoding, data, trailer)
    }
}

/// Shared shape of the header that precedes every entry array in an
/// [XBLOCK/XXBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5b7a6935-e83d-4917-9f62-6ce3707f09e0)
/// or a sub-node
/// [SIBLOCK/SLBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/32ce8c94-4757-46c8-a169-3fd21abee584).
///
/// `level` distinguishes a leaf block (`0`) from an intermediate one (`1` or `2` for XBLOCKs);
/// the concrete block type to parse is chosen by the caller after peeking this header, the same
/// way [`page::RootBTreePage`](super::page::RootBTreePage) peeks `cLevel`.
pub trait IntermediateTreeHeader: Copy + Sized {
    fn level(&self) -> u8;
    fn entry_count(&self) -> u16;
}

pub trait IntermediateTreeEntry: Copy + Sized {}

/// A page of an intermediate tree: an XBLOCK/XXBLOCK data tree, or a SIBLOCK/SLBLOCK sub-node
/// tree. All three share the same read/write shape: a small header, an array of fixed-size
/// entries, and a [`BlockTrailer`].
pub trait IntermediateTreeBlock: Sized {
    type Header: IntermediateTreeHeader;
    type Entry: IntermediateTreeEntry;
    type Trailer: BlockTrailer;

    fn header(&self) -> Self::Header;
    fn entries(&self) -> &[Self::Entry];
    fn trailer(&self) -> &Self::Trailer;
}

/// Extracts the [`BlockId`] a data tree entry points at, whether that entry is a raw BID (XBLOCK)
/// or something richer.
pub trait IntermediateDataTreeEntry<Pst>
where
    Pst: PstFile,
{
    fn block(&self) -> Pst::BlockId;
}

fn verify_internal_level(level: u8) -> NdbResult<()> {
    if (1..=2).contains(&level) {
        Ok(())
    } else {
        Err(NdbError::InvalidInternalBlockLevel(level))
    }
}

/// [XBLOCK/XXBLOCK header](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5b7a6935-e83d-4917-9f62-6ce3707f09e0)
#[derive(Clone, Copy, Default)]
pub struct DataTreeBlockHeader {
    level: u8,
    entry_count: u16,
    total_size: u32,
}

impl DataTreeBlockHeader {
    pub fn new(level: u8, entry_count: u16, total_size: u32) -> NdbResult<Self> {
        verify_internal_level(level)?;
        Ok(Self {
            level,
            entry_count,
            total_size,
        })
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }
}

impl IntermediateTreeHeader for DataTreeBlockHeader {
    fn level(&self) -> u8 {
        self.level
    }

    fn entry_count(&self) -> u16 {
        self.entry_count
    }
}

impl IntermediateTreeHeaderReadWrite for DataTreeBlockHeader {
    const HEADER_SIZE: u16 = 8;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let block_type = f.read_u8()?;
        if block_type != 0x01 {
            return Err(NdbError::InvalidInternalBlockType(block_type).into());
        }
        let level = f.read_u8()?;
        let entry_count = f.read_u16::<LittleEndian>()?;
        let total_size = f.read_u32::<LittleEndian>()?;
        Ok(Self::new(level, entry_count, total_size)?)
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u8(0x01)?;
        f.write_u8(self.level)?;
        f.write_u16::<LittleEndian>(self.entry_count)?;
        f.write_u32::<LittleEndian>(self.total_size)
    }
}

/// A single BID in an XBLOCK/XXBLOCK's entry array.
#[derive(Clone, Copy, Default)]
pub struct UnicodeDataTreeEntry(UnicodeBlockId);

impl IntermediateTreeEntry for UnicodeDataTreeEntry {}

impl IntermediateTreeEntryReadWrite for UnicodeDataTreeEntry {
    const ENTRY_SIZE: u16 = 8;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        Ok(Self(UnicodeBlockId::read(f)?))
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.0.write(f)
    }
}

impl From<UnicodeBlockId> for UnicodeDataTreeEntry {
    fn from(value: UnicodeBlockId) -> Self {
        Self(value)
    }
}

impl IntermediateDataTreeEntry<UnicodePstFile> for UnicodeDataTreeEntry {
    fn block(&self) -> UnicodeBlockId {
        self.0
    }
}

#[derive(Clone, Copy, Default)]
pub struct AnsiDataTreeEntry(AnsiBlockId);

impl IntermediateTreeEntry for AnsiDataTreeEntry {}

impl IntermediateTreeEntryReadWrite for AnsiDataTreeEntry {
    const ENTRY_SIZE: u16 = 4;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        Ok(Self(AnsiBlockId::read(f)?))
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.0.write(f)
    }
}

impl From<AnsiBlockId> for AnsiDataTreeEntry {
    fn from(value: AnsiBlockId) -> Self {
        Self(value)
    }
}

impl IntermediateDataTreeEntry<AnsiPstFile> for AnsiDataTreeEntry {
    fn block(&self) -> AnsiBlockId {
        self.0
    }
}

#[derive(Clone, Default)]
pub struct UnicodeDataTreeBlock {
    header: DataTreeBlockHeader,
    entries: Vec<UnicodeDataTreeEntry>,
    trailer: UnicodeBlockTrailer,
}

impl IntermediateTreeBlock for UnicodeDataTreeBlock {
    type Header = DataTreeBlockHeader;
    type Entry = UnicodeDataTreeEntry;
    type Trailer = UnicodeBlockTrailer;

    fn header(&self) -> Self::Header {
        self.header
    }

    fn entries(&self) -> &[Self::Entry] {
        &self.entries
    }

    fn trailer(&self) -> &Self::Trailer {
        &self.trailer
    }
}

impl IntermediateTreeBlockReadWrite for UnicodeDataTreeBlock {
    fn new(
        header: Self::Header,
        entries: Vec<Self::Entry>,
        trailer: Self::Trailer,
    ) -> NdbResult<Self> {
        if !trailer.block_id().is_internal() {
            return Err(NdbError::InvalidUnicodeBlockTrailerId(u64::from(
                trailer.block_id(),
            )));
        }
        Ok(Self {
            header,
            entries,
            trailer,
        })
    }
}

#[derive(Clone, Default)]
pub struct AnsiDataTreeBlock {
    header: DataTreeBlockHeader,
    entries: Vec<AnsiDataTreeEntry>,
    trailer: AnsiBlockTrailer,
}

impl IntermediateTreeBlock for AnsiDataTreeBlock {
    type Header = DataTreeBlockHeader;
    type Entry = AnsiDataTreeEntry;
    type Trailer = AnsiBlockTrailer;

    fn header(&self) -> Self::Header {
        self.header
    }

    fn entries(&self) -> &[Self::Entry] {
        &self.entries
    }

    fn trailer(&self) -> &Self::Trailer {
        &self.trailer
    }
}

impl IntermediateTreeBlockReadWrite for AnsiDataTreeBlock {
    fn new(
        header: Self::Header,
        entries: Vec<Self::Entry>,
        trailer: Self::Trailer,
    ) -> NdbResult<Self> {
        if !trailer.block_id().is_internal() {
            return Err(NdbError::InvalidAnsiBlockTrailerId(u32::from(
                trailer.block_id(),
            )));
        }
        Ok(Self {
            header,
            entries,
            trailer,
        })
    }
}

/// [SIBLOCK/SLBLOCK header](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5774b4d5-d3b4-4b2d-9455-5b8e17d2f9a1),
/// shared between the intermediate (SIBLOCK) and leaf (SLBLOCK) pages of a sub-node tree.
#[derive(Clone, Copy, Default)]
pub struct SubNodeTreeBlockHeader {
    level: u8,
    entry_count: u16,
}

impl SubNodeTreeBlockHeader {
    pub fn new(level: u8, entry_count: u16) -> NdbResult<Self> {
        if level > 1 {
            return Err(NdbError::InvalidInternalBlockLevel(level));
        }
        Ok(Self { level, entry_count })
    }
}

impl IntermediateTreeHeader for SubNodeTreeBlockHeader {
    fn level(&self) -> u8 {
        self.level
    }

    fn entry_count(&self) -> u16 {
        self.entry_count
    }
}

impl IntermediateTreeHeaderReadWrite for SubNodeTreeBlockHeader {
    const HEADER_SIZE: u16 = 4;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let block_type = f.read_u8()?;
        if block_type != 0x02 {
            return Err(NdbError::InvalidInternalBlockType(block_type).into());
        }
        let level = f.read_u8()?;
        let entry_count = f.read_u16::<LittleEndian>()?;
        Ok(Self::new(level, entry_count)?)
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u8(0x02)?;
        f.write_u8(self.level)?;
        f.write_u16::<LittleEndian>(self.entry_count)
    }
}

impl SubNodeTreeBlockHeaderReadWrite for SubNodeTreeBlockHeader {}

/// [SIENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5774b4d5-d3b4-4b2d-9455-5b8e17d2f9a1):
/// points from a sub-node id at the SLBLOCK holding that sub-node's own entries.
#[derive(Clone, Copy, Default)]
pub struct IntermediateSubNodeTreeEntry<B> {
    node: NodeId,
    block: B,
}

impl<B> IntermediateSubNodeTreeEntry<B> {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl<B> IntermediateSubNodeTreeEntry<B>
where
    B: Copy,
{
    pub fn block(&self) -> B {
        self.block
    }
}

impl<B> IntermediateTreeEntry for IntermediateSubNodeTreeEntry<B> where B: Copy {}

impl IntermediateTreeEntryReadWrite for IntermediateSubNodeTreeEntry<UnicodeBlockId> {
    const ENTRY_SIZE: u16 = 12;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let node = NodeId::read(f)?;
        let block = UnicodeBlockId::read(f)?;
        Ok(Self { node, block })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.node.write(f)?;
        self.block.write(f)
    }
}

impl IntermediateTreeEntryReadWrite for IntermediateSubNodeTreeEntry<AnsiBlockId> {
    const ENTRY_SIZE: u16 = 8;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let node = NodeId::read(f)?;
        let block = AnsiBlockId::read(f)?;
        Ok(Self { node, block })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.node.write(f)?;
        self.block.write(f)
    }
}

/// [SLENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5774b4d5-d3b4-4b2d-9455-5b8e17d2f9a1):
/// a sub-node's own data BID, plus an optional BID of that sub-node's own sub-node tree.
#[derive(Clone, Copy, Default)]
pub struct LeafSubNodeTreeEntry<B> {
    node: NodeId,
    data: B,
    sub_node: Option<B>,
}

impl<B> LeafSubNodeTreeEntry<B>
where
    B: Copy,
{
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn data(&self) -> B {
        self.data
    }

    pub fn sub_node(&self) -> Option<B> {
        self.sub_node
    }
}

impl<B> IntermediateTreeEntry for LeafSubNodeTreeEntry<B> where B: Copy {}

impl IntermediateTreeEntryReadWrite for LeafSubNodeTreeEntry<UnicodeBlockId> {
    const ENTRY_SIZE: u16 = 20;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let node = NodeId::read(f)?;
        let data = UnicodeBlockId::read(f)?;
        let sub_node = UnicodeBlockId::read(f)?;
        let sub_node = (u64::from(sub_node) != 0).then_some(sub_node);
        Ok(Self {
            node,
            data,
            sub_node,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.node.write(f)?;
        self.data.write(f)?;
        self.sub_node.unwrap_or_default().write(f)
    }
}

impl IntermediateTreeEntryReadWrite for LeafSubNodeTreeEntry<AnsiBlockId> {
    const ENTRY_SIZE: u16 = 12;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let node = NodeId::read(f)?;
        let data = AnsiBlockId::read(f)?;
        let sub_node = AnsiBlockId::read(f)?;
        let sub_node = (u32::from(sub_node) != 0).then_some(sub_node);
        Ok(Self {
            node,
            data,
            sub_node,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.node.write(f)?;
        self.data.write(f)?;
        self.sub_node.unwrap_or_default().write(f)
    }
}

macro_rules! impl_sub_node_tree_block {
    ($block:ident, $entry:ty, $block_id:ty, $trailer:ty, $invalid_trailer:ident) => {
        #[derive(Clone, Default)]
        pub struct $block {
            header: SubNodeTreeBlockHeader,
            entries: Vec<$entry>,
            trailer: $trailer,
        }

        impl IntermediateTreeBlock for $block {
            type Header = SubNodeTreeBlockHeader;
            type Entry = $entry;
            type Trailer = $trailer;

            fn header(&self) -> Self::Header {
                self.header
            }

            fn entries(&self) -> &[Self::Entry] {
                &self.entries
            }

            fn trailer(&self) -> &Self::Trailer {
                &self.trailer
            }
        }

        impl IntermediateTreeBlockReadWrite for $block {
            fn new(
                header: Self::Header,
                entries: Vec<Self::Entry>,
                trailer: Self::Trailer,
            ) -> NdbResult<Self> {
                if !trailer.block_id().is_internal() {
                    return Err(NdbError::$invalid_trailer(<$block_id>::from(
                        trailer.block_id(),
                    )));
                }
                Ok(Self {
                    header,
                    entries,
                    trailer,
                })
            }
        }
    };
}

impl_sub_node_tree_block!(
    UnicodeIntermediateSubNodeTreeBlock,
    IntermediateSubNodeTreeEntry<UnicodeBlockId>,
    u64,
    UnicodeBlockTrailer,
    InvalidUnicodeBlockTrailerId
);
impl_sub_node_tree_block!(
    UnicodeLeafSubNodeTreeBlock,
    LeafSubNodeTreeEntry<UnicodeBlockId>,
    u64,
    UnicodeBlockTrailer,
    InvalidUnicodeBlockTrailerId
);
impl_sub_node_tree_block!(
    AnsiIntermediateSubNodeTreeBlock,
    IntermediateSubNodeTreeEntry<AnsiBlockId>,
    u32,
    AnsiBlockTrailer,
    InvalidAnsiBlockTrailerId
);
impl_sub_node_tree_block!(
    AnsiLeafSubNodeTreeBlock,
    LeafSubNodeTreeEntry<AnsiBlockId>,
    u32,
    AnsiBlockTrailer,
    InvalidAnsiBlockTrailerId
);

pub type UnicodeSubNodeTreeBlockHeader = SubNodeTreeBlockHeader;
pub type AnsiSubNodeTreeBlockHeader = SubNodeTreeBlockHeader;
pub type UnicodeIntermediateSubNodeTreeEntry = IntermediateSubNodeTreeEntry<UnicodeBlockId>;
pub type AnsiIntermediateSubNodeTreeEntry = IntermediateSubNodeTreeEntry<AnsiBlockId>;
pub type UnicodeLeafSubNodeTreeEntry = LeafSubNodeTreeEntry<UnicodeBlockId>;
pub type AnsiLeafSubNodeTreeEntry = LeafSubNodeTreeEntry<AnsiBlockId>;

/// Decoded leaf block bytes, keyed by file offset, so a single call resolving a data tree across
/// many sibling values doesn't re-read and re-decrypt a block shared between them.
pub type DataBlockCache = HashMap<u64, Rc<Vec<u8>>>;

fn byte_offset<Pst>(block_ref: &Pst::BlockRef) -> u64
where
    Pst: PstFile,
    u64: From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
{
    (*block_ref.index()).index().into()
}

/// A data tree: the (possibly multi-block) XBLOCK/XXBLOCK storage backing a property value too
/// large to fit in a single block, or a bare leaf block when it isn't.
///
/// Holds only the root [`BlockBTreeEntry`], so building one never touches the file; the actual
/// blocks are read and decrypted lazily by [`DataTree::reader`] or [`DataTree::blocks`].
pub struct DataTree<Pst>
where
    Pst: PstFile,
{
    entry: Pst::BlockBTreeEntry,
}

impl<Pst> Clone for DataTree<Pst>
where
    Pst: PstFile,
{
    fn clone(&self) -> Self {
        Self { entry: self.entry }
    }
}

impl<Pst> DataTree<Pst>
where
    Pst: PstFile,
{
    pub fn read<R: Read + Seek>(
        _f: &mut R,
        _encoding: NdbCryptMethod,
        entry: &Pst::BlockBTreeEntry,
    ) -> io::Result<Self> {
        Ok(Self { entry: *entry })
    }

    #[allow(clippy::too_many_arguments)]
    fn collect<R>(
        f: &mut R,
        encoding: NdbCryptMethod,
        block_btree: &Pst::BlockBTree,
        page_cache: &mut RootBTreePageCache<Pst::BlockBTree>,
        block_cache: &mut DataBlockCache,
        entry: &Pst::BlockBTreeEntry,
    ) -> io::Result<Vec<Vec<u8>>>
    where
        R: Read + Seek,
        <Pst as PstFile>::BlockBTree: BlockBTreeReadWrite<Pst, <Pst as PstFile>::BlockBTreeEntry>,
        <Pst as PstFile>::DataTreeBlock: IntermediateTreeBlockReadWrite,
        <Pst as PstFile>::DataTreeEntry:
            IntermediateTreeEntryReadWrite + IntermediateDataTreeEntry<Pst>,
        <Pst as PstFile>::DataBlock: BlockReadWrite + Clone,
        u64: From<<<Pst as PstFile>::BlockId as BlockId>::Index>
            + From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
    {
        let block_ref = entry.block();
        let offset = byte_offset::<Pst>(&block_ref);

        if let Some(cached) = block_cache.get(&offset) {
            return Ok(vec![(**cached).clone()]);
        }

        if block_ref.block().is_internal() {
            f.seek(SeekFrom::Start(offset))?;
            let header_size = <<Pst::DataTreeBlock as IntermediateTreeBlock>::Header as
                IntermediateTreeHeaderReadWrite>::HEADER_SIZE;
            let mut header_buf = vec![0_u8; header_size as usize];
            f.read_exact(&mut header_buf)?;
            let mut header_cursor = Cursor::new(&header_buf[..]);
            let header = <<Pst::DataTreeBlock as IntermediateTreeBlock>::Header as
                IntermediateTreeHeaderReadWrite>::read(&mut header_cursor)?;
            f.seek(SeekFrom::Start(offset))?;
            let tree_block =
                <Pst::DataTreeBlock as IntermediateTreeBlockReadWrite>::read(f, header, entry.size())?;

            let mut blocks = Vec::new();
            for child in tree_block.entries() {
                let child_id = child.block();
                let key: <Pst as PstFile>::BTreeKey = child_id.search_key();
                let child_entry = block_btree.find_entry(f, key, page_cache)?;
                blocks.extend(Self::collect(
                    f,
                    encoding,
                    block_btree,
                    page_cache,
                    block_cache,
                    &child_entry,
                )?);
            }
            Ok(blocks)
        } else {
            f.seek(SeekFrom::Start(offset))?;
            let block = <Pst::DataBlock as BlockReadWrite>::read(f, entry.size(), encoding)?;
            let data = block.data().to_vec();
            block_cache.insert(offset, Rc::new(data.clone()));
            Ok(vec![data])
        }
    }

    /// The tree's leaf blocks, each decrypted but not concatenated, in order.
    pub fn blocks<R>(
        &self,
        f: &mut R,
        encoding: NdbCryptMethod,
        block_btree: &Pst::BlockBTree,
    ) -> io::Result<std::vec::IntoIter<Vec<u8>>>
    where
        R: Read + Seek,
        <Pst as PstFile>::BlockBTree: BlockBTreeReadWrite<Pst, <Pst as PstFile>::BlockBTreeEntry>,
        <Pst as PstFile>::DataTreeBlock: IntermediateTreeBlockReadWrite,
        <Pst as PstFile>::DataTreeEntry:
            IntermediateTreeEntryReadWrite + IntermediateDataTreeEntry<Pst>,
        <Pst as PstFile>::DataBlock: BlockReadWrite + Clone,
        u64: From<<<Pst as PstFile>::BlockId as BlockId>::Index>
            + From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
    {
        let mut page_cache = Default::default();
        let mut block_cache = Default::default();
        let blocks = Self::collect(
            f,
            encoding,
            block_btree,
            &mut page_cache,
            &mut block_cache,
            &self.entry,
        )?;
        Ok(blocks.into_iter())
    }

    /// A [`Read`] over the tree's full, concatenated value.
    #[allow(clippy::too_many_arguments)]
    pub fn reader<R>(
        &self,
        f: &mut R,
        encoding: NdbCryptMethod,
        block_btree: &Pst::BlockBTree,
        page_cache: &mut RootBTreePageCache<Pst::BlockBTree>,
        block_cache: &mut DataBlockCache,
    ) -> io::Result<Cursor<Vec<u8>>>
    where
        R: Read + Seek,
        <Pst as PstFile>::BlockBTree: BlockBTreeReadWrite<Pst, <Pst as PstFile>::BlockBTreeEntry>,
        <Pst as PstFile>::DataTreeBlock: IntermediateTreeBlockReadWrite,
        <Pst as PstFile>::DataTreeEntry:
            IntermediateTreeEntryReadWrite + IntermediateDataTreeEntry<Pst>,
        <Pst as PstFile>::DataBlock: BlockReadWrite + Clone,
        u64: From<<<Pst as PstFile>::BlockId as BlockId>::Index>
            + From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
    {
        let blocks = Self::collect(f, encoding, block_btree, page_cache, block_cache, &self.entry)?;
        Ok(Cursor::new(blocks.concat()))
    }
}

pub type UnicodeDataTree = DataTree<UnicodePstFile>;
pub type AnsiDataTree = DataTree<AnsiPstFile>;

/// A sub-node tree: the SIBLOCK/SLBLOCK structure holding a node's own child nodes, each with
/// their own data (and possibly their own nested sub-node tree).
pub struct SubNodeTree<Pst>
where
    Pst: PstFile,
{
    entry: Pst::BlockBTreeEntry,
}

impl<Pst> Clone for SubNodeTree<Pst>
where
    Pst: PstFile,
{
    fn clone(&self) -> Self {
        Self { entry: self.entry }
    }
}

impl<Pst> SubNodeTree<Pst>
where
    Pst: PstFile,
{
    pub fn read<R: Read + Seek>(_f: &mut R, entry: &Pst::BlockBTreeEntry) -> io::Result<Self> {
        Ok(Self { entry: *entry })
    }

    fn collect<R>(
        f: &mut R,
        block_btree: &Pst::BlockBTree,
        page_cache: &mut RootBTreePageCache<Pst::BlockBTree>,
        entry: &Pst::BlockBTreeEntry,
    ) -> io::Result<Vec<LeafSubNodeTreeEntry<Pst::BlockId>>>
    where
        R: Read + Seek,
        <Pst as PstFile>::BlockBTree: BlockBTreeReadWrite<Pst, <Pst as PstFile>::BlockBTreeEntry>,
        <Pst as PstFile>::SubNodeTreeBlockHeader: SubNodeTreeBlockHeaderReadWrite,
        <Pst as PstFile>::SubNodeTreeBlock: IntermediateTreeBlockReadWrite<
            Header = <Pst as PstFile>::SubNodeTreeBlockHeader,
            Entry = IntermediateSubNodeTreeEntry<<Pst as PstFile>::BlockId>,
        >,
        <Pst as PstFile>::SubNodeBlock: IntermediateTreeBlockReadWrite<
            Header = <Pst as PstFile>::SubNodeTreeBlockHeader,
            Entry = LeafSubNodeTreeEntry<<Pst as PstFile>::BlockId>,
        >,
        u64: From<<<Pst as PstFile>::BlockId as BlockId>::Index>
            + From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
    {
        let block_ref = entry.block();
        let offset = byte_offset::<Pst>(&block_ref);
        f.seek(SeekFrom::Start(offset))?;

        let header_size = <<Pst as PstFile>::SubNodeTreeBlockHeader as
            IntermediateTreeHeaderReadWrite>::HEADER_SIZE;
        let mut header_buf = vec![0_u8; header_size as usize];
        f.read_exact(&mut header_buf)?;
        let mut header_cursor = Cursor::new(&header_buf[..]);
        let header = <<Pst as PstFile>::SubNodeTreeBlockHeader as
            IntermediateTreeHeaderReadWrite>::read(&mut header_cursor)?;
        f.seek(SeekFrom::Start(offset))?;

        if header.level() == 0 {
            let block =
                <Pst::SubNodeBlock as IntermediateTreeBlockReadWrite>::read(f, header, entry.size())?;
            Ok(block.entries().to_vec())
        } else {
            let block = <Pst::SubNodeTreeBlock as IntermediateTreeBlockReadWrite>::read(
                f,
                header,
                entry.size(),
            )?;
            let mut leaves = Vec::new();
            for child in block.entries() {
                let key: <Pst as PstFile>::BTreeKey = child.block().search_key();
                let child_entry = block_btree.find_entry(f, key, page_cache)?;
                leaves.extend(Self::collect(f, block_btree, page_cache, &child_entry)?);
            }
            Ok(leaves)
        }
    }

    /// Every leaf sub-node entry reachable from this tree's root, flattened in key order.
    pub fn entries<R>(
        &self,
        f: &mut R,
        block_btree: &Pst::BlockBTree,
    ) -> io::Result<std::vec::IntoIter<LeafSubNodeTreeEntry<Pst::BlockId>>>
    where
        R: Read + Seek,
        <Pst as PstFile>::BlockBTree: BlockBTreeReadWrite<Pst, <Pst as PstFile>::BlockBTreeEntry>,
        <Pst as PstFile>::SubNodeTreeBlockHeader: SubNodeTreeBlockHeaderReadWrite,
        <Pst as PstFile>::SubNodeTreeBlock: IntermediateTreeBlockReadWrite<
            Header = <Pst as PstFile>::SubNodeTreeBlockHeader,
            Entry = IntermediateSubNodeTreeEntry<<Pst as PstFile>::BlockId>,
        >,
        <Pst as PstFile>::SubNodeBlock: IntermediateTreeBlockReadWrite<
            Header = <Pst as PstFile>::SubNodeTreeBlockHeader,
            Entry = LeafSubNodeTreeEntry<<Pst as PstFile>::BlockId>,
        >,
        u64: From<<<Pst as PstFile>::BlockId as BlockId>::Index>
            + From<<<Pst as PstFile>::ByteIndex as ByteIndex>::Index>,
    {
        let mut page_cache = Default::default();
        let leaves = Self::collect(f, block_btree, &mut page_cache, &self.entry)?;
        Ok(leaves.into_iter())
    }
}

pub type UnicodeSubNodeTree = SubNodeTree<UnicodePstFile>;
pub type AnsiSubNodeTree = SubNodeTree<AnsiPstFile>;
