//! In-memory WOFF2 fixtures and reference SFNT writers shared by the integration tests
#![allow(dead_code)]

use bytes::BufMut;
use font_types::Tag;
use woff2_sfnt::{
    compute_checksum, table_tags::KNOWN_TABLE_TAGS, variable_length::BufMutVariableExt,
};

pub const TRUETYPE: Tag = Tag::new(&[0, 1, 0, 0]);
pub const GLYF: Tag = Tag::new(b"glyf");
pub const LOCA: Tag = Tag::new(b"loca");
pub const HEAD: Tag = Tag::new(b"head");
pub const HHEA: Tag = Tag::new(b"hhea");
pub const HMTX: Tag = Tag::new(b"hmtx");
pub const MAXP: Tag = Tag::new(b"maxp");
pub const CUSTOM: Tag = Tag::new(b"TEST");

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn round4(n: usize) -> usize {
    (n + 3) & !3
}

/// Wrap `data` in a brotli stream made only of uncompressed meta-blocks
pub fn stored_brotli(data: &[u8]) -> Vec<u8> {
    // WBITS = 16, ISLAST = 1, ISLASTEMPTY = 1
    if data.is_empty() {
        return vec![0x06];
    }
    let mut out = Vec::with_capacity(data.len() + 8);
    for (i, chunk) in data.chunks(1 << 15).enumerate() {
        let mlen_minus_1 = (chunk.len() - 1) as u32;
        // ISLAST = 0, MNIBBLES = 4 (2 bits of 0), MLEN - 1 (16 bits), ISUNCOMPRESSED = 1.
        // The first meta-block is preceded by a single 0 bit selecting a 16 bit window.
        let header = if i == 0 {
            (mlen_minus_1 << 4) | (1 << 20)
        } else {
            (mlen_minus_1 << 3) | (1 << 19)
        };
        out.extend_from_slice(&header.to_le_bytes()[..3]);
        out.extend_from_slice(chunk);
    }
    // ISLAST = 1, ISLASTEMPTY = 1
    out.push(0x03);
    out
}

pub struct TestTable {
    pub tag: Tag,
    pub version: u8,
    pub orig_length: u32,
    pub transformed: bool,
    /// Bytes stored in the decompressed stream
    pub data: Vec<u8>,
}

impl TestTable {
    pub fn raw(tag: Tag, data: Vec<u8>) -> Self {
        Self {
            tag,
            version: if tag == GLYF || tag == LOCA { 3 } else { 0 },
            orig_length: data.len() as u32,
            transformed: false,
            data,
        }
    }

    pub fn transformed(tag: Tag, orig_length: usize, data: Vec<u8>) -> Self {
        Self {
            tag,
            version: if tag == HMTX { 1 } else { 0 },
            orig_length: orig_length as u32,
            transformed: true,
            data,
        }
    }
}

pub struct CollectionFont {
    pub flavor: Tag,
    pub table_indices: Vec<u16>,
}

pub struct Woff2Builder {
    pub flavor: Tag,
    pub tables: Vec<TestTable>,
    pub collection: Option<(u32, Vec<CollectionFont>)>,
    pub metadata: Option<Vec<u8>>,
    pub private_data: Option<Vec<u8>>,
    /// Replaces the brotli stream that would otherwise be generated from the tables
    pub compressed: Option<Vec<u8>>,
}

impl Woff2Builder {
    pub fn new(flavor: Tag, tables: Vec<TestTable>) -> Self {
        Self {
            flavor,
            tables,
            collection: None,
            metadata: None,
            private_data: None,
            compressed: None,
        }
    }

    pub fn collection(version: u32, tables: Vec<TestTable>, fonts: Vec<CollectionFont>) -> Self {
        Self {
            collection: Some((version, fonts)),
            ..Self::new(Tag::new(b"ttcf"), tables)
        }
    }

    /// The decompressed font data: every table's stream bytes back to back
    pub fn font_data(&self) -> Vec<u8> {
        self.tables.iter().flat_map(|t| t.data.iter().copied()).collect()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut directory = Vec::new();
        for table in &self.tables {
            match KNOWN_TABLE_TAGS.iter().position(|tag| *tag == table.tag) {
                Some(index) => directory.put_u8(index as u8 | (table.version << 6)),
                None => {
                    directory.put_u8(63 | (table.version << 6));
                    directory.put_slice(&table.tag.to_be_bytes());
                }
            }
            directory.put_variable_128_u32(table.orig_length);
            if table.transformed {
                directory.put_variable_128_u32(table.data.len() as u32);
            }
        }
        if let Some((version, fonts)) = &self.collection {
            directory.put_u32(*version);
            directory.put_variable_255_u16(fonts.len() as u16);
            for font in fonts {
                directory.put_variable_255_u16(font.table_indices.len() as u16);
                directory.put_slice(&font.flavor.to_be_bytes());
                for &index in &font.table_indices {
                    directory.put_variable_255_u16(index);
                }
            }
        }

        let compressed = match &self.compressed {
            Some(compressed) => compressed.clone(),
            None => stored_brotli(&self.font_data()),
        };

        let mut out = vec![0u8; 48];
        out.extend_from_slice(&directory);
        out.extend_from_slice(&compressed);

        let (mut meta_offset, mut meta_length) = (0, 0);
        if let Some(metadata) = &self.metadata {
            out.resize(round4(out.len()), 0);
            meta_offset = out.len();
            meta_length = metadata.len();
            out.extend_from_slice(metadata);
        }
        let (mut priv_offset, mut priv_length) = (0, 0);
        if let Some(private_data) = &self.private_data {
            out.resize(round4(out.len()), 0);
            priv_offset = out.len();
            priv_length = private_data.len();
            out.extend_from_slice(private_data);
        }

        let total_sfnt_size: usize = 12
            + 16 * self.tables.len()
            + self
                .tables
                .iter()
                .map(|t| round4(t.orig_length as usize))
                .sum::<usize>();

        let length = out.len();
        let mut header = &mut out[..48];
        header.put_slice(b"wOF2");
        header.put_slice(&self.flavor.to_be_bytes());
        header.put_u32(length as u32);
        header.put_u16(self.tables.len() as u16);
        header.put_u16(0); // reserved
        header.put_u32(total_sfnt_size as u32);
        header.put_u32(compressed.len() as u32);
        header.put_u16(1); // majorVersion
        header.put_u16(0); // minorVersion
        header.put_u32(meta_offset as u32);
        header.put_u32(meta_length as u32);
        header.put_u32(meta_length as u32); // metaOrigLength
        header.put_u32(priv_offset as u32);
        header.put_u32(priv_length as u32);

        out
    }
}

/// Overwrite a big-endian u32 field of an encoded file
pub fn patch_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn patch_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_offset_table(out: &mut Vec<u8>, flavor: Tag, num_tables: usize) {
    let entry_selector = (num_tables as f64).log2().floor() as u16;
    let search_range = 16 * (1u16 << entry_selector);
    out.put_slice(&flavor.to_be_bytes());
    out.put_u16(num_tables as u16);
    out.put_u16(search_range);
    out.put_u16(entry_selector);
    out.put_u16(16 * num_tables as u16 - search_range);
}

fn table_checksum(tag: Tag, data: &[u8]) -> u32 {
    if tag == HEAD {
        let mut zeroed = data.to_vec();
        zeroed[8..12].fill(0);
        compute_checksum(&zeroed)
    } else {
        compute_checksum(data)
    }
}

/// Append a table (with checkSumAdjustment zeroed for head) and its padding. Returns its offset.
fn place_table(out: &mut Vec<u8>, tag: Tag, data: &[u8]) -> usize {
    let offset = out.len();
    out.extend_from_slice(data);
    if tag == HEAD {
        out[offset + 8..offset + 12].fill(0);
    }
    out.resize(round4(out.len()), 0);
    offset
}

/// Reference SFNT writer: tables are stored in the given order, the directory is sorted by tag
pub fn build_sfnt(flavor: Tag, tables: &[(Tag, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    write_offset_table(&mut out, flavor, tables.len());
    out.resize(12 + 16 * tables.len(), 0);

    let offsets: Vec<usize> = tables
        .iter()
        .map(|(tag, data)| place_table(&mut out, *tag, data))
        .collect();

    let mut sorted: Vec<usize> = (0..tables.len()).collect();
    sorted.sort_by_key(|&i| tables[i].0);
    let mut entries = Vec::new();
    for i in sorted {
        let (tag, data) = &tables[i];
        entries.put_slice(&tag.to_be_bytes());
        entries.put_u32(table_checksum(*tag, data));
        entries.put_u32(offsets[i] as u32);
        entries.put_u32(data.len() as u32);
    }
    out[12..12 + entries.len()].copy_from_slice(&entries);

    if let Some(head) = tables.iter().position(|(tag, _)| *tag == HEAD) {
        let adjustment = 0xB1B0AFBA_u32.wrapping_sub(compute_checksum(&out));
        patch_u32(&mut out, offsets[head] + 8, adjustment);
    }
    out
}

/// Reference TTC writer.
///
/// Tables are stored font by font in tag order, each one once; with `glyf_then_loca` a font's
/// loca is stored straight after its glyf.
pub fn build_ttc(
    version: u32,
    tables: &[(Tag, Vec<u8>)],
    fonts: &[(Tag, Vec<usize>)],
    glyf_then_loca: bool,
) -> Vec<u8> {
    let sorted: Vec<Vec<usize>> = fonts
        .iter()
        .map(|(_, indices)| {
            let mut indices = indices.clone();
            indices.sort_by_key(|&i| tables[i].0);
            indices
        })
        .collect();

    let mut out = Vec::new();
    out.put_slice(b"ttcf");
    out.put_u32(version);
    out.put_u32(fonts.len() as u32);
    let mut directory_offset = 12 + 4 * fonts.len() + if version == 0x00020000 { 12 } else { 0 };
    for indices in &sorted {
        out.put_u32(directory_offset as u32);
        directory_offset += 12 + 16 * indices.len();
    }
    if version == 0x00020000 {
        out.put_slice(&[0; 12]);
    }

    let mut directory_positions = Vec::new();
    for ((flavor, _), indices) in fonts.iter().zip(&sorted) {
        directory_positions.push(out.len());
        write_offset_table(&mut out, *flavor, indices.len());
        for &i in indices {
            out.put_slice(&tables[i].0.to_be_bytes());
            out.put_slice(&[0; 12]);
        }
    }
    // Checksum of the TTC header and all directories before any entry is filled in
    let header_checksum = compute_checksum(&out);

    let mut offsets: Vec<Option<usize>> = vec![None; tables.len()];
    for indices in &sorted {
        for &i in indices {
            if offsets[i].is_none() {
                offsets[i] = Some(place_table(&mut out, tables[i].0, &tables[i].1));
            }
            if glyf_then_loca && tables[i].0 == GLYF {
                if let Some(&loca) = indices.iter().find(|&&j| tables[j].0 == LOCA) {
                    if offsets[loca].is_none() {
                        offsets[loca] = Some(place_table(&mut out, LOCA, &tables[loca].1));
                    }
                }
            }
        }
    }

    for (indices, &position) in sorted.iter().zip(&directory_positions) {
        let mut font_checksum = header_checksum;
        for (k, &i) in indices.iter().enumerate() {
            let (tag, data) = &tables[i];
            let checksum = table_checksum(*tag, data);
            let offset = offsets[i].unwrap_or_default() as u32;
            let entry = position + 12 + 16 * k + 4;
            patch_u32(&mut out, entry, checksum);
            patch_u32(&mut out, entry + 4, offset);
            patch_u32(&mut out, entry + 8, data.len() as u32);
            font_checksum = font_checksum
                .wrapping_add(checksum)
                .wrapping_add(checksum)
                .wrapping_add(offset)
                .wrapping_add(data.len() as u32);
        }
        if let Some(&head) = indices.iter().find(|&&i| tables[i].0 == HEAD) {
            let adjustment = 0xB1B0AFBA_u32.wrapping_sub(font_checksum);
            patch_u32(&mut out, offsets[head].unwrap_or_default() + 8, adjustment);
        }
    }

    out
}

// A three glyph TrueType font: a triangle, an empty glyph and a composite.

/// (0,0) (7,1) (6,-32): one contour, no instructions, padded to 4 bytes
pub const SIMPLE_GLYPH: [u8; 24] = [
    0, 1, 0, 0, 0xff, 0xe0, 0, 7, 0, 1, 0, 2, 0, 0, 0x31, 0x37, 0x07, 7, 1, 1, 33, 0, 0, 0,
];
pub const COMPOSITE_GLYPH: [u8; 16] = [0xff, 0xff, 0, 1, 0, 2, 0, 3, 0, 4, 0, 2, 0, 0, 5, 6];
pub const NUM_GLYPHS: u16 = 3;
pub const NUM_HMETRICS: u16 = 2;

pub fn glyf_table() -> Vec<u8> {
    [&SIMPLE_GLYPH[..], &COMPOSITE_GLYPH[..]].concat()
}

pub fn loca_table(index_format: u16) -> Vec<u8> {
    let offsets = [0u32, 24, 24, 40];
    let mut loca = Vec::new();
    for offset in offsets {
        if index_format == 0 {
            loca.put_u16((offset / 2) as u16);
        } else {
            loca.put_u32(offset);
        }
    }
    loca
}

pub fn transformed_glyf(index_format: u16) -> Vec<u8> {
    let streams: [&[u8]; 7] = [
        &[0, 1, 0, 0, 0xff, 0xff],                       // nContour
        &[3],                                            // nPoints
        &[0, 23, 28],                                    // flags
        &[0, 0x60, 0x00, 0],                             // glyphs
        &[0, 2, 0, 0, 5, 6],                             // composites
        &[0x20, 0, 0, 0, 0, 1, 0, 2, 0, 3, 0, 4],        // bboxes
        &[],                                             // instructions
    ];
    let mut out = Vec::new();
    out.put_u16(0); // reserved
    out.put_u16(0); // optionFlags
    out.put_u16(NUM_GLYPHS);
    out.put_u16(index_format);
    for stream in &streams {
        out.put_u32(stream.len() as u32);
    }
    for stream in &streams {
        out.put_slice(stream);
    }
    out
}

pub fn head_table(index_to_loc_format: u16, revision: u32) -> Vec<u8> {
    let mut head = Vec::new();
    head.put_u32(0x00010000); // version
    head.put_u32(revision); // fontRevision
    head.put_u32(0x12345678); // checkSumAdjustment, recomputed on decode
    head.put_u32(0x5F0F3CF5); // magicNumber
    head.put_u16(0); // flags
    head.put_u16(1000); // unitsPerEm
    head.put_slice(&[0; 16]); // created, modified
    head.put_slice(&[0, 0, 0xff, 0xe0, 0, 7, 0, 4]); // bbox
    head.put_u16(0); // macStyle
    head.put_u16(8); // lowestRecPPEM
    head.put_u16(2); // fontDirectionHint
    head.put_u16(index_to_loc_format);
    head.put_u16(0); // glyphDataFormat
    head
}

pub fn hhea_table(num_hmetrics: u16) -> Vec<u8> {
    let mut hhea = vec![0u8; 34];
    hhea[..4].copy_from_slice(&[0, 1, 0, 0]);
    hhea.put_u16(num_hmetrics);
    hhea
}

pub fn maxp_table(num_glyphs: u16) -> Vec<u8> {
    let mut maxp = Vec::new();
    maxp.put_u32(0x00005000);
    maxp.put_u16(num_glyphs);
    maxp
}

/// Advances 500 and 600, every lsb equal to its glyph's xMin
pub fn hmtx_table() -> Vec<u8> {
    vec![0x01, 0xf4, 0, 0, 0x02, 0x58, 0, 0, 0, 1]
}

pub fn transformed_hmtx(flags: u8) -> Vec<u8> {
    let mut hmtx = vec![flags, 0x01, 0xf4, 0x02, 0x58];
    if flags & 1 == 0 {
        hmtx.extend_from_slice(&[0, 0, 0, 0]); // proportional lsbs
    }
    if flags & 2 == 0 {
        hmtx.extend_from_slice(&[0, 1]); // monospace lsbs
    }
    hmtx
}

/// An odd-length table with a tag outside the known-tag table
pub fn custom_table() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}
