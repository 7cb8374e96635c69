use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use bytes::Buf;
use font_types::Tag;

use crate::Round4;
use crate::error::{WuffErr, bail, bail_if, usize_will_overflow};
use crate::table_tags::{ARBITRARY_TAG_INDEX, CFF, CFF2, GLYF, HMTX, LOCA, known_tag};
use crate::variable_length::BufVariableExt;

pub const WOFF2_SIG: Tag = Tag::new(b"wOF2");

pub const TRUETYPE_FLAVOR: Tag = Tag::new(&[0x00, 0x01, 0x00, 0x00]);
pub const OPENTYPE_FLAVOR: Tag = Tag::new(b"OTTO");
pub const APPLE_TRUETYPE_FLAVOR: Tag = Tag::new(b"true");
pub const TYPE1_FLAVOR: Tag = Tag::new(b"typ1");
pub const COLLECTION_FLAVOR: Tag = Tag::new(b"ttcf");

/// Size of the fixed WOFF2 header in bytes
pub const WOFF2_HEADER_SIZE: usize = 48;

pub const TTC_VERSION_1: u32 = 0x00010000;
pub const TTC_VERSION_2: u32 = 0x00020000;

/// A parsed WOFF2 file.
///
/// Holds the header, the table directory, the collection directory (for TTC
/// flavored files) and borrowed views of the three data blocks. The metadata
/// and private blocks are opaque; only their placement is validated.
pub struct Woff2<'a> {
    pub header: Woff2Header,
    pub table_directory: Woff2TableDirectory,
    pub collection_directory: Option<CollectionDirectory>,
    /// The brotli compressed font data
    pub compressed_data: &'a [u8],
    /// The (still compressed) extended metadata block
    pub metadata: Option<&'a [u8]>,
    pub private_data: Option<&'a [u8]>,
}

impl<'a> Woff2<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, WuffErr> {
        // Here we create a new view over `data`. Because we pass `&mut input` to parsing functions,
        // they will actually mutate the slice (not the data it points to) such that it only includes unparsed data.
        let mut input = data;

        let header = Woff2Header::parse(&mut input)?;
        let table_directory =
            Woff2TableDirectory::parse(&mut input, header.num_tables as usize, header.is_collection())?;
        let collection_directory = if header.is_collection() {
            Some(CollectionDirectory::parse(&mut input, &table_directory)?)
        } else {
            check_font_tables(header.flavor, &table_directory, 0..table_directory.len())?;
            None
        };

        let compressed_offset = data.len() - input.len();
        let (compressed_data, metadata, private_data) =
            split_blocks(data, &header, compressed_offset)?;

        Ok(Self {
            header,
            table_directory,
            collection_directory,
            compressed_data,
            metadata,
            private_data,
        })
    }

    /// The fonts contained in this file.
    ///
    /// For a single font a one-font collection listing every table is generated so
    /// that serialization logic can be shared between collections and single fonts.
    pub fn fonts(&self) -> CollectionDirectory {
        match &self.collection_directory {
            Some(collection) => collection.clone(),
            None => CollectionDirectory::generate_for_single_font(
                self.header.flavor,
                &self.table_directory,
            ),
        }
    }
}

/// Locate the compressed data, metadata and private blocks and check that they
/// are laid out back to back on 4-byte boundaries with nothing after them.
///
/// <https://www.w3.org/TR/WOFF2/#woff20Header>
fn split_blocks<'a>(
    data: &'a [u8],
    header: &Woff2Header,
    compressed_offset: usize,
) -> Result<(&'a [u8], Option<&'a [u8]>, Option<&'a [u8]>), WuffErr> {
    let compressed_length = header.total_compressed_size as usize;
    bail_if!(
        compressed_length == 0,
        WuffErr::Block("totalCompressedSize must not be zero")
    );
    bail_if!(
        usize_will_overflow(compressed_offset, compressed_length)
            || compressed_offset + compressed_length > data.len(),
        WuffErr::Block("compressed font data exceeds file length")
    );
    let compressed_data = &data[compressed_offset..(compressed_offset + compressed_length)];
    let mut block_end = compressed_offset + compressed_length;

    let mut metadata = None;
    if header.meta_offset != 0 {
        let meta_offset = header.meta_offset as usize;
        bail_if!(
            meta_offset != Round4!(block_end),
            WuffErr::Block("metadata block must directly follow the compressed font data")
        );
        check_padding(&data[block_end..meta_offset])?;
        // In range: checked against the file length when parsing the header
        let meta_end = meta_offset + header.meta_length as usize;
        metadata = Some(&data[meta_offset..meta_end]);
        block_end = meta_end;
    }

    let mut private_data = None;
    if header.priv_offset != 0 {
        let priv_offset = header.priv_offset as usize;
        bail_if!(
            priv_offset != Round4!(block_end),
            WuffErr::Block("private data block must directly follow the preceding block")
        );
        check_padding(&data[block_end..priv_offset])?;
        let priv_end = priv_offset + header.priv_length as usize;
        private_data = Some(&data[priv_offset..priv_end]);
        block_end = priv_end;
    }

    bail_if!(
        Round4!(block_end) != Round4!(data.len()),
        WuffErr::Block("extraneous data after last block")
    );
    check_padding(&data[block_end..])?;

    Ok((compressed_data, metadata, private_data))
}

fn check_padding(padding: &[u8]) -> Result<(), WuffErr> {
    bail_if!(
        padding.iter().any(|&byte| byte != 0),
        WuffErr::Block("padding between blocks must be zero")
    );
    Ok(())
}

/// Check the per-font table invariants shared by single fonts and the fonts
/// of a collection: glyf/loca pairing and ordering, and that the outline
/// tables agree with the flavor.
fn check_font_tables(
    flavor: Tag,
    tables: &Woff2TableDirectory,
    table_indices: impl IntoIterator<Item = usize>,
) -> Result<(), WuffErr> {
    let mut glyf_idx: Option<usize> = None;
    let mut loca_idx: Option<usize> = None;
    let mut has_cff = false;
    for idx in table_indices {
        match tables[idx].tag {
            GLYF => glyf_idx = Some(idx),
            LOCA => loca_idx = Some(idx),
            CFF | CFF2 => has_cff = true,
            _ => {}
        }
    }

    // 'glyf' without 'loca' doesn't make sense, and the transform covers both or neither
    match (glyf_idx, loca_idx) {
        (Some(glyf_idx), Some(loca_idx)) => {
            let (glyf, loca) = (&tables[glyf_idx], &tables[loca_idx]);
            bail_if!(
                glyf.is_transformed() != loca.is_transformed(),
                WuffErr::GlyfLocaMismatch
            );
            bail_if!(
                loca_idx < glyf_idx,
                WuffErr::Ordering {
                    tag: LOCA,
                    after: GLYF
                }
            );
            bail_if!(
                loca.is_transformed() && loca.transform_length != Some(0),
                WuffErr::transform(LOCA, "transformLength must be zero")
            );
        }
        (Some(_), None) | (None, Some(_)) => bail!(WuffErr::GlyfLocaMismatch),
        (None, None) => {}
    }

    match flavor {
        TRUETYPE_FLAVOR | APPLE_TRUETYPE_FLAVOR => {
            bail_if!(has_cff, WuffErr::Header("bad flavor: TrueType font with CFF data"))
        }
        OPENTYPE_FLAVOR => {
            bail_if!(
                glyf_idx.is_some(),
                WuffErr::Header("bad flavor: CFF font with glyf data")
            )
        }
        _ => {}
    }

    Ok(())
}

fn is_sfnt_flavor(flavor: Tag) -> bool {
    matches!(
        flavor,
        TRUETYPE_FLAVOR | OPENTYPE_FLAVOR | APPLE_TRUETYPE_FLAVOR | TYPE1_FLAVOR
    )
}

/// WOFF2 header
///
/// <https://www.w3.org/TR/WOFF2/#woff20Header>
#[derive(Clone, Debug)]
pub struct Woff2Header {
    /// b"wOF2"
    pub signature: Tag,
    /// The "sfnt version" of the input font.
    pub flavor: Tag,
    /// Total size of the WOFF file.
    pub length: u32,
    /// Number of entries in directory of font tables.
    pub num_tables: u16,
    /// Reserved; set to 0.
    pub reserved: u16,
    /// Total size needed for the uncompressed font data, including the sfnt header, directory, and font tables (including padding).
    pub total_sfnt_size: u32,
    /// Total length of the compressed data block.
    pub total_compressed_size: u32,
    /// Major version of the WOFF file.
    pub major_version: u16,
    /// Minor version of the WOFF file.
    pub minor_version: u16,
    /// Offset to metadata block, from beginning of WOFF file.
    pub meta_offset: u32,
    /// Length of compressed metadata block.
    pub meta_length: u32,
    /// Uncompressed size of metadata block.
    pub meta_orig_length: u32,
    /// Offset to private data block, from beginning of WOFF file.
    pub priv_offset: u32,
    /// Length of private data block.
    pub priv_length: u32,
}

impl Woff2Header {
    pub fn parse(input: &mut impl Buf) -> Result<Self, WuffErr> {
        let input_len = input.remaining();
        bail_if!(
            input_len < WOFF2_HEADER_SIZE,
            WuffErr::Header("file is smaller than the WOFF2 header")
        );
        let input_len_u32 = u32::try_from(input_len)
            .map_err(|_| WuffErr::Header("length in header must match file size"))?;

        let signature = Tag::from_u32(input.try_get_u32()?);
        bail_if!(signature != WOFF2_SIG, WuffErr::Header("bad signature"));

        let header = Self {
            signature,
            flavor: Tag::from_u32(input.try_get_u32()?),
            length: input.try_get_u32()?,
            num_tables: input.try_get_u16()?,
            reserved: input.try_get_u16()?,
            total_sfnt_size: input.try_get_u32()?,
            total_compressed_size: input.try_get_u32()?,
            major_version: input.try_get_u16()?,
            minor_version: input.try_get_u16()?,
            meta_offset: input.try_get_u32()?,
            meta_length: input.try_get_u32()?,
            meta_orig_length: input.try_get_u32()?,
            priv_offset: input.try_get_u32()?,
            priv_length: input.try_get_u32()?,
        };

        // Validate
        bail_if!(
            !is_sfnt_flavor(header.flavor) && !header.is_collection(),
            WuffErr::Header("bad flavor")
        );
        bail_if!(
            header.length != input_len_u32,
            WuffErr::Header("length in header must match file size")
        );
        bail_if!(
            header.num_tables == 0,
            WuffErr::Header("numTables in header must not be zero")
        );
        bail_if!(
            header.reserved != 0,
            WuffErr::Header("reserved in header must be zero")
        );
        if header.meta_offset != 0 {
            bail_if!(
                header.meta_offset >= input_len_u32
                    || input_len_u32 - header.meta_offset < header.meta_length,
                WuffErr::Block("metadata block exceeds file length")
            );
        } else {
            bail_if!(
                header.meta_length != 0 || header.meta_orig_length != 0,
                WuffErr::Block("metadata length must be zero when the block is absent")
            );
        }
        if header.priv_offset != 0 {
            bail_if!(
                header.priv_offset >= input_len_u32
                    || input_len_u32 - header.priv_offset < header.priv_length,
                WuffErr::Block("private data block exceeds file length")
            );
        } else {
            bail_if!(
                header.priv_length != 0,
                WuffErr::Block("private data length must be zero when the block is absent")
            );
        }

        Ok(header)
    }

    pub fn is_collection(&self) -> bool {
        self.flavor == COLLECTION_FLAVOR
    }
}

pub struct TableDirectory<T> {
    pub tables: Vec<T>,
    /// Size of the table directory (in the WOFF) in bytes
    pub size: usize,
}
pub type Woff2TableDirectory = TableDirectory<Woff2TableDirectoryEntry>;

impl<T> Deref for TableDirectory<T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.tables
    }
}
impl<T> DerefMut for TableDirectory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tables
    }
}

impl<T> TableDirectory<T> {
    /// Size of the table directory (in the WOFF) in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Woff2TableDirectory {
    pub fn parse(
        input: &mut impl Buf,
        num_tables: usize,
        is_collection: bool,
    ) -> Result<Self, WuffErr> {
        let initial_remaining = input.remaining();

        // Tables in the CompressedFontData field of the WOFF are stored directly after each other
        // in the order they specified in the header. So we can determine the offset for each table
        // by adding up the lengths of each table (which are stored in the directory entries).
        //
        // <https://www.w3.org/TR/WOFF2/#table_format>
        let mut offset_in_woff: u32 = 0;
        let mut seen_tags: HashSet<Tag> = HashSet::with_capacity(num_tables);

        let mut tables = Vec::with_capacity(num_tables);
        for _ in 0..num_tables {
            let mut table = Woff2TableDirectoryEntry::parse(input)?;
            table.woff_offset = offset_in_woff;

            // Collections may contain several tables with the same tag (one per font)
            bail_if!(
                !seen_tags.insert(table.tag) && !is_collection,
                WuffErr::table(table.tag, "table defined more than once")
            );

            // Add the length of the table to offset_in_woff to determine the offset of the next table
            offset_in_woff = offset_in_woff
                .checked_add(table.woff_length)
                .ok_or(WuffErr::Directory("sum of table lengths overflows"))?;

            tables.push(table);
        }

        // Because the table directory is variable length, we compute it's size (in bytes) by tracking how
        // much data we have processed during processing. This allows us to know the offset that the next
        // section of the file begins at.
        let size_of_directory = initial_remaining - input.remaining();

        Ok(Self {
            tables,
            size: size_of_directory,
        })
    }

    /// Total size of the decompressed font data: every table's stream bytes back to back
    pub fn uncompressed_size(&self) -> usize {
        self.tables
            .last()
            .map(|table| table.woff_offset as usize + table.woff_length as usize)
            .unwrap_or(0)
    }
}

/// How a table's bytes in the decompressed stream become its SFNT bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableTransform {
    /// Copied through unchanged
    Raw,
    /// Rebuilt from the transformed glyf stream (loca has no bytes of its own)
    GlyfLoca,
    /// Rebuilt from the transformed hmtx stream plus glyf bounding boxes
    Hmtx,
}

/// <https://www.w3.org/TR/WOFF2/#table_dir_format>
#[derive(Clone, Debug)]
pub struct Woff2TableDirectoryEntry {
    /// 4-byte tag (optional)
    pub tag: Tag,
    /// 2 bits representing the preprocessing transformation version
    pub format: u8,
    /// Length of original table.
    pub orig_length: u32, // uBase128,
    /// Length of the transformed table. Present iff the table is transformed.
    pub transform_length: Option<u32>, // uBase128,
    /// Offset of the table within the (decompressed) CompressedFontData field of the WOFF
    pub woff_offset: u32, // Computed
    /// Length of the table within the (decompressed) CompressedFontData field of the WOFF
    pub woff_length: u32, // Computed
}

impl Woff2TableDirectoryEntry {
    /// Whether the table has been transformed
    ///
    /// For all tables in a font, except for 'glyf' and 'loca' tables, transformation version 0 indicates the null transform
    /// where the original table data is passed directly to the Brotli compressor for inclusion in the compressed data stream.
    /// For 'glyf' and 'loca' tables, transformation version 3 indicates the null transform where the original table data was
    /// passed directly to the Brotli compressor without applying any pre-processing defined in subclause 5.1 and subclause 5.3.
    pub fn is_transformed(&self) -> bool {
        self.transform() != TableTransform::Raw
    }

    pub fn transform(&self) -> TableTransform {
        match (self.tag, self.format) {
            (GLYF | LOCA, 0) => TableTransform::GlyfLoca,
            (HMTX, 1) => TableTransform::Hmtx,
            _ => TableTransform::Raw,
        }
    }

    pub fn data_as_slice<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], WuffErr> {
        let end = self.woff_offset as usize + self.woff_length as usize;
        data.get((self.woff_offset as usize)..end)
            .ok_or(WuffErr::table(self.tag, "table data exceeds decompressed font data"))
    }

    pub fn parse(input: &mut impl Buf) -> Result<Self, WuffErr> {
        let flags = input.try_get_u8()?;
        let (tag, format) = Self::parse_flags(flags);

        // Note: we only parse the tag field from the input if it is not contained within the flags
        let tag = match tag {
            Some(tag) => tag,
            None => Tag::from_u32(input.try_get_u32()?),
        };

        let valid_format = match tag {
            GLYF | LOCA => format == 0 || format == 3,
            HMTX => format == 0 || format == 1,
            _ => format == 0,
        };
        bail_if!(
            !valid_format,
            WuffErr::table(tag, "invalid transformation version")
        );

        let mut entry = Self {
            tag,
            format,
            orig_length: input.try_get_variable_128_u32()?,
            transform_length: None,
            woff_offset: 0, // Set in TableDirectory parse function
            woff_length: 0,
        };
        if entry.is_transformed() {
            entry.transform_length = Some(input.try_get_variable_128_u32()?);
        }
        entry.woff_length = entry.transform_length.unwrap_or(entry.orig_length);

        Ok(entry)
    }

    /// Parse flags field into "known tag" and "format"
    ///
    /// The interpretation of the flags field is as follows. Bits [0..5] contain an index to the "known tag" table,
    /// which represents tags likely to appear in fonts. If the tag is not present in this table, then the value of
    /// this bit field is 63. Bits 6 and 7 indicate the preprocessing transformation version number (0-3) that was
    /// applied to each table.
    pub fn parse_flags(flags: u8) -> (Option<Tag>, u8) {
        const TAG_MASK: u8 = 0b00111111;
        const FORMAT_MASK: u8 = 0b11000000;
        let tag_bits = flags & TAG_MASK;
        let format = (flags & FORMAT_MASK) >> 6;
        let tag = match tag_bits {
            ARBITRARY_TAG_INDEX => None,
            _ => known_tag(tag_bits),
        };
        (tag, format)
    }
}

/// <https://www.w3.org/TR/WOFF2/#collection_dir_format>
#[derive(Clone, Debug)]
pub struct CollectionDirectory {
    /// The Version of the TTC Header in the original font.
    pub version: u32,
    /// Number of fonts in the file
    pub fonts: Vec<CollectionDirectoryEntry>,
}

impl CollectionDirectory {
    pub fn parse(
        input: &mut impl Buf,
        table_directory: &Woff2TableDirectory,
    ) -> Result<Self, WuffErr> {
        let version = input.try_get_u32()?;
        let num_fonts = input.try_get_variable_255_u16()?;

        bail_if!(
            version != TTC_VERSION_1 && version != TTC_VERSION_2,
            WuffErr::Directory("unsupported collection version")
        );
        bail_if!(
            num_fonts == 0,
            WuffErr::Directory("collection must contain at least one font")
        );

        let mut fonts = Vec::with_capacity(num_fonts as usize);
        for _ in 0..num_fonts {
            fonts.push(CollectionDirectoryEntry::parse(input, table_directory)?);
        }

        Ok(Self { version, fonts })
    }

    /// Generate a fake `CollectionDirectory` for a single font so that we can share
    /// serialization logic between collection and single fonts.
    pub fn generate_for_single_font(flavor: Tag, table_directory: &Woff2TableDirectory) -> Self {
        let table_indices: Vec<u16> = (0..(table_directory.len() as u16)).collect();
        Self {
            version: TTC_VERSION_1, // Hardcode: will be ignored
            fonts: vec![CollectionDirectoryEntry::new(
                flavor,
                table_indices,
                table_directory,
            )],
        }
    }

    /// Re-order each font's tables in output (OTSpec) order
    pub fn sort_tables_within_each_font(&mut self, tables: &Woff2TableDirectory) {
        for font in &mut self.fonts {
            font.table_indices
                .sort_by_cached_key(|idx| tables[*idx as usize].tag);
        }
    }

    /// Size of the collection header. Ref http://www.microsoft.com/typography/otspec/otff.htm,
    /// True Type Collections
    pub(crate) fn collection_header_size(&self) -> usize {
        let mut size: usize = 12 // TTCTag, Version, numFonts
          + 4 * self.fonts.len(); // OffsetTable[numFonts]
        if self.version == TTC_VERSION_2 {
            size += 12; // ulDsig{Tag,Length,Offset}
        }
        size
    }
}

/// <https://www.w3.org/TR/WOFF2/#collection_dir_format>
#[derive(Clone, Debug)]
pub struct CollectionDirectoryEntry {
    /// The "sfnt version" of the font
    pub flavor: Tag,
    /// In a TTC file, each font reference some subset of the tables in the file.
    /// This field records which tables this particular font references.
    pub table_indices: Vec<u16>, //255UInt16

    // The indices of specific tables that we want random access to
    pub head_idx: Option<u16>,
    pub hhea_idx: Option<u16>,
    pub maxp_idx: Option<u16>,
    pub glyf_idx: Option<u16>,
    pub loca_idx: Option<u16>,
}

impl CollectionDirectoryEntry {
    fn new(flavor: Tag, table_indices: Vec<u16>, tables: &Woff2TableDirectory) -> Self {
        let mut entry = Self {
            flavor,
            table_indices,
            head_idx: None,
            hhea_idx: None,
            maxp_idx: None,
            glyf_idx: None,
            loca_idx: None,
        };
        for &table_index in &entry.table_indices {
            let slot = match tables[table_index as usize].tag.as_ref() {
                b"head" => &mut entry.head_idx,
                b"hhea" => &mut entry.hhea_idx,
                b"maxp" => &mut entry.maxp_idx,
                b"glyf" => &mut entry.glyf_idx,
                b"loca" => &mut entry.loca_idx,
                _ => continue,
            };
            *slot = Some(table_index);
        }
        entry
    }

    pub fn parse(input: &mut impl Buf, tables: &Woff2TableDirectory) -> Result<Self, WuffErr> {
        let num_tables = input.try_get_variable_255_u16()?;
        let flavor = Tag::from_u32(input.try_get_u32()?);

        bail_if!(
            num_tables == 0,
            WuffErr::Directory("collection font must contain at least one table")
        );
        bail_if!(!is_sfnt_flavor(flavor), WuffErr::Header("bad flavor"));

        let mut seen_tags: HashSet<Tag> = HashSet::with_capacity(num_tables as usize);
        let mut table_indices = Vec::with_capacity(num_tables as usize);
        for _ in 0..num_tables {
            let table_index = input.try_get_variable_255_u16()?;
            bail_if!(
                table_index as usize >= tables.len(),
                WuffErr::Directory("collection font references a table that does not exist")
            );
            let tag = tables[table_index as usize].tag;
            bail_if!(
                !seen_tags.insert(tag),
                WuffErr::table(tag, "table defined more than once")
            );
            table_indices.push(table_index);
        }

        check_font_tables(
            flavor,
            tables,
            table_indices.iter().map(|&idx| idx as usize),
        )?;

        Ok(Self::new(flavor, table_indices, tables))
    }

    pub fn num_tables(&self) -> usize {
        self.table_indices.len()
    }

    /// The size required for a table directory for this font
    pub fn table_directory_size(&self) -> usize {
        12 + (16 * self.num_tables())
    }
}
