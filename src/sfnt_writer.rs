//! Serialization of reconstructed tables into an SFNT font or TTC collection

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::BufMut;
use font_types::Tag;

use crate::{
    Round4, compute_checksum,
    error::WuffErr,
    table_tags::HEAD,
    woff::headers::{COLLECTION_FLAVOR, CollectionDirectory, TTC_VERSION_2},
};

/// Value the checksum of a whole font must sum to once `head.checkSumAdjustment` is set
pub const CHECKSUM_MAGIC: u32 = 0xB1B0AFBA;

/// Offset of checkSumAdjustment within the 'head' table
const CHECKSUM_ADJUSTMENT_OFFSET: usize = 8;

/// A table ready to be written to the output font.
///
/// Raw tables borrow straight from the decompressed font data, transformed
/// tables own their reconstructed bytes.
pub struct ReconstructedTable<'a> {
    pub tag: Tag,
    pub data: Cow<'a, [u8]>,
    /// Set when this is a loca table rebuilt from a transformed glyf table
    pub loca_format: Option<u16>,
    /// Whether this is a glyf table whose loca was rebuilt alongside it
    pub is_transformed_glyf: bool,
}

impl<'a> ReconstructedTable<'a> {
    pub fn raw(tag: Tag, data: &'a [u8]) -> Self {
        Self {
            tag,
            data: Cow::Borrowed(data),
            loca_format: None,
            is_transformed_glyf: false,
        }
    }

    pub fn owned(tag: Tag, data: Vec<u8>) -> Self {
        Self {
            tag,
            data: Cow::Owned(data),
            loca_format: None,
            is_transformed_glyf: false,
        }
    }

    /// Table checksum as stored in the table directory.
    ///
    /// For 'head' this is computed as if checkSumAdjustment were zero.
    pub fn checksum(&self) -> u32 {
        let checksum = compute_checksum(&self.data);
        if self.tag == HEAD {
            match self.data.get(CHECKSUM_ADJUSTMENT_OFFSET..CHECKSUM_ADJUSTMENT_OFFSET + 4) {
                Some(&[a, b, c, d]) => checksum.wrapping_sub(u32::from_be_bytes([a, b, c, d])),
                _ => checksum,
            }
        } else {
            checksum
        }
    }
}

#[derive(Clone, Copy, Default)]
struct TableMetadata {
    checksum: u32,
    dst_offset: u32,
    dst_length: u32,
}

impl TableMetadata {
    pub fn header_checksum_contribution(&self) -> u32 {
        self.checksum
            .wrapping_add(self.dst_offset)
            .wrapping_add(self.dst_length)
    }
}

#[derive(Clone, Default)]
struct FontInfo {
    /// Checksum of this font's table directory (updated as entries are filled in)
    header_checksum: u32,
    /// Offset of each table's directory entry within the output
    table_entry_by_tag: HashMap<Tag, usize>,
}

struct HeaderData {
    data: Vec<u8>,
    /// Checksum of the TTC header and every (still empty) table directory
    checksum: u32,
    font_infos: Vec<FontInfo>,
}

impl HeaderData {
    /// Update the table entry with real values.
    fn update_table_entry(&mut self, font_idx: usize, tag: Tag, metadata: TableMetadata) {
        let info = &mut self.font_infos[font_idx];
        if let Some(&table_entry_offset) = info.table_entry_by_tag.get(&tag) {
            let mut out = &mut self.data[(table_entry_offset + 4)..];
            out.put_u32(metadata.checksum);
            out.put_u32(metadata.dst_offset);
            out.put_u32(metadata.dst_length);
        }
        info.header_checksum = info
            .header_checksum
            .wrapping_add(metadata.header_checksum_contribution());
    }
}

/// Lay out the reconstructed tables of every font as an SFNT (single font) or TTC (collection).
///
/// `tables` is indexed like the WOFF2 table directory. The table indices of each font in
/// `fonts` must already be sorted by tag, and every index they reference must be populated.
pub(crate) fn write_sfnt(
    fonts: &CollectionDirectory,
    is_collection: bool,
    tables: &[Option<ReconstructedTable>],
) -> Result<Vec<u8>, WuffErr> {
    let mut out_header = generate_header(fonts, is_collection, tables)?;
    let header_len = out_header.data.len();

    // Tables are appended to `out` after a zeroed region that the header is copied into at the end
    let mut out: Vec<u8> = vec![0; header_len];

    // Metadata for tables that have been written. Index corresponds to the table's index within the directory
    let mut table_metadata: Vec<Option<TableMetadata>> = vec![None; tables.len()];

    for (font_idx, font) in fonts.fonts.iter().enumerate() {
        let mut font_checksum: u32 = if is_collection {
            out_header.checksum
        } else {
            out_header.font_infos[font_idx].header_checksum
        };

        // Note: tables within each font have already been sorted in table tag order.
        for &table_idx in &font.table_indices {
            let table_idx = table_idx as usize;
            let table = reconstructed(tables, table_idx)?;

            let metadata = match table_metadata[table_idx] {
                // Shared with an earlier font, or loca already written straight after its glyf
                Some(metadata) => metadata,
                None => {
                    let metadata = write_table(&mut out, table)?;
                    table_metadata[table_idx] = Some(metadata);

                    // A transformed glyf is immediately followed by its loca
                    if table.is_transformed_glyf {
                        if let Some(loca_idx) = font.loca_idx.map(|idx| idx as usize) {
                            if table_metadata[loca_idx].is_none() {
                                let loca = reconstructed(tables, loca_idx)?;
                                table_metadata[loca_idx] = Some(write_table(&mut out, loca)?);
                            }
                        }
                    }
                    metadata
                }
            };

            // Update font checksum with the checksum for the table
            font_checksum = font_checksum.wrapping_add(metadata.checksum);

            // Fill in the table entry. We replaced 0's, so update the checksum too.
            out_header.update_table_entry(font_idx, table.tag, metadata);
            font_checksum = font_checksum.wrapping_add(metadata.header_checksum_contribution());
        }

        // Update 'head' checkSumAdjustment. The head checksum above was computed with it set to 0.
        //
        // <https://learn.microsoft.com/en-us/typography/opentype/spec/otff#calculating-checksums>
        let checksum_adjustment = CHECKSUM_MAGIC.wrapping_sub(font_checksum);
        if let Some(head_metadata) = font.head_idx.and_then(|idx| table_metadata[idx as usize]) {
            let offset = head_metadata.dst_offset as usize + CHECKSUM_ADJUSTMENT_OFFSET;
            if let Some(mut writer) = out.get_mut(offset..offset + 4) {
                writer.put_u32(checksum_adjustment);
            }
        }

        log::trace!(
            "font {font_idx}: {} tables, checkSumAdjustment {checksum_adjustment:#010x}",
            font.num_tables()
        );
    }

    out[..header_len].copy_from_slice(&out_header.data);

    Ok(out)
}

fn reconstructed<'t, 'a>(
    tables: &'t [Option<ReconstructedTable<'a>>],
    table_idx: usize,
) -> Result<&'t ReconstructedTable<'a>, WuffErr> {
    tables
        .get(table_idx)
        .and_then(Option::as_ref)
        .ok_or(WuffErr::Directory("font references a table that was not reconstructed"))
}

/// Append a table (and its padding) to the output
fn write_table(out: &mut Vec<u8>, table: &ReconstructedTable) -> Result<TableMetadata, WuffErr> {
    let dst_offset = u32::try_from(out.len())
        .map_err(|_| WuffErr::overflow(table.tag, "table offset exceeds 32 bits"))?;
    let dst_length = u32::try_from(table.data.len())
        .map_err(|_| WuffErr::overflow(table.tag, "table length exceeds 32 bits"))?;

    out.extend_from_slice(&table.data);
    out.resize(Round4!(out.len()), 0);

    if table.tag == HEAD {
        // Zeroed until the font checksum is known
        if let Some(adjustment) = out.get_mut(
            dst_offset as usize + CHECKSUM_ADJUSTMENT_OFFSET
                ..dst_offset as usize + CHECKSUM_ADJUSTMENT_OFFSET + 4,
        ) {
            adjustment.fill(0);
        }
    }

    Ok(TableMetadata {
        checksum: table.checksum(),
        dst_offset,
        dst_length,
    })
}

/// Size of the collection header (if any) plus every table directory
fn compute_header_size(fonts: &CollectionDirectory, is_collection: bool) -> usize {
    let directories: usize = fonts.fonts.iter().map(|font| font.table_directory_size()).sum();
    if is_collection {
        directories + fonts.collection_header_size()
    } else {
        directories
    }
}

fn generate_header(
    fonts: &CollectionDirectory,
    is_collection: bool,
    tables: &[Option<ReconstructedTable>],
) -> Result<HeaderData, WuffErr> {
    let num_fonts = fonts.fonts.len();
    let size_of_header = compute_header_size(fonts, is_collection);
    let mut output: Vec<u8> = Vec::with_capacity(size_of_header);
    let mut font_infos: Vec<FontInfo> = vec![FontInfo::default(); num_fonts];

    let mut checksum: u32 = 0;

    // If TTC: write TTC header
    if is_collection {
        output.put_u32(u32::from_be_bytes(COLLECTION_FLAVOR.to_be_bytes())); // TAG TTCTag
        output.put_u32(fonts.version); // FIXED Version
        output.put_u32(num_fonts as u32); // ULONG numFonts

        // Write tableDirectoryOffsets
        let mut table_directory_offset = fonts.collection_header_size();
        for font in fonts.fonts.iter() {
            output.put_u32(table_directory_offset as u32);
            table_directory_offset += font.table_directory_size();
        }

        // space for DSIG fields for header v2
        if fonts.version == TTC_VERSION_2 {
            output.put_u32(0); // ULONG ulDsigTag
            output.put_u32(0); // ULONG ulDsigLength
            output.put_u32(0); // ULONG ulDsigOffset
        }

        checksum = checksum.wrapping_add(compute_checksum(&output));
    }

    // Write table directory(s)
    // If file is a TTC: one per font. Else for a single font: one in total.
    for (font, info) in fonts.fonts.iter().zip(font_infos.iter_mut()) {
        let start_offset = output.len();
        write_table_directory_header(&mut output, font.flavor, font.num_tables() as u16);

        for &table_index in &font.table_indices {
            let tag = reconstructed(tables, table_index as usize)?.tag;
            info.table_entry_by_tag.insert(tag, output.len());
            write_empty_offset_table_entry(&mut output, tag);
        }

        info.header_checksum = compute_checksum(&output[start_offset..]);
        checksum = checksum.wrapping_add(info.header_checksum);
    }

    Ok(HeaderData {
        data: output,
        font_infos,
        checksum,
    })
}

/// Writes an OpenType table directory header
///
/// <https://learn.microsoft.com/en-us/typography/opentype/spec/otff#table-directory>
pub(crate) fn write_table_directory_header(output: &mut impl BufMut, flavor: Tag, num_tables: u16) {
    let mut max_pow2: u16 = 0;
    while 1u32 << (max_pow2 + 1) <= (num_tables as u32) {
        max_pow2 += 1;
    }
    let entry_selector = max_pow2;
    let search_range: u16 = (1u16 << max_pow2) << 4;
    let range_shift = (((num_tables as u32) << 4) - search_range as u32) as u16;

    output.put_u32(u32::from_be_bytes(flavor.to_be_bytes())); // sfnt version
    output.put_u16(num_tables); // num_tables
    output.put_u16(search_range); // searchRange
    output.put_u16(entry_selector); // entrySelector
    output.put_u16(range_shift); // rangeShift
}

// Writes a single Offset Table entry
fn write_empty_offset_table_entry(output: &mut impl BufMut, tag: Tag) {
    output.put_u32(u32::from_be_bytes(tag.to_be_bytes()));
    output.put_u32(0);
    output.put_u32(0);
    output.put_u32(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::woff::headers::{CollectionDirectoryEntry, TRUETYPE_FLAVOR};
    use pretty_assertions::assert_eq;

    #[test]
    fn binary_search_fields() {
        for (num_tables, expected) in [
            (1u16, [16u16, 0, 0]),
            (2, [32, 1, 0]),
            (9, [128, 3, 16]),
            (16, [256, 4, 0]),
            (17, [256, 4, 16]),
        ] {
            let mut out = Vec::new();
            write_table_directory_header(&mut out, TRUETYPE_FLAVOR, num_tables);
            let fields: Vec<u16> = out[6..12]
                .chunks(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            assert_eq!(fields, expected, "{num_tables} tables");
        }
    }

    fn head_table() -> Vec<u8> {
        let mut head = vec![0u8; 54];
        head[8..12].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        head[12..16].copy_from_slice(&[0x5f, 0x0f, 0x3c, 0xf5]);
        head
    }

    #[test]
    fn head_checksum_ignores_adjustment() {
        let mut zeroed = head_table();
        zeroed[8..12].fill(0);
        assert_eq!(
            ReconstructedTable::owned(HEAD, head_table()).checksum(),
            compute_checksum(&zeroed)
        );
    }

    #[test]
    fn single_font_layout_and_checksum() {
        let tables = vec![
            Some(ReconstructedTable::owned(Tag::new(b"zzzz"), vec![1, 2, 3])),
            Some(ReconstructedTable::owned(HEAD, head_table())),
        ];
        let fonts = CollectionDirectory {
            version: 0x00010000,
            fonts: vec![CollectionDirectoryEntry {
                flavor: TRUETYPE_FLAVOR,
                table_indices: vec![1, 0],
                head_idx: Some(1),
                hhea_idx: None,
                maxp_idx: None,
                glyf_idx: None,
                loca_idx: None,
            }],
        };
        let out = write_sfnt(&fonts, false, &tables).unwrap();

        // 12 + 2 * 16 byte directory, then head (54 -> 56 bytes) then zzzz (3 -> 4 bytes)
        assert_eq!(out.len(), 44 + 56 + 4);
        assert_eq!(&out[12..16], b"head");
        assert_eq!(&out[20..24], &44u32.to_be_bytes());
        assert_eq!(&out[24..28], &54u32.to_be_bytes());
        assert_eq!(&out[28..32], b"zzzz");
        assert_eq!(&out[36..40], &100u32.to_be_bytes());
        assert_eq!(&out[100..104], &[1, 2, 3, 0]);
        assert_eq!(compute_checksum(&out), CHECKSUM_MAGIC);
    }
}
