//! Structural checks run on the reconstructed tables of a font before it is written out

use bytes::Buf;

use crate::{
    error::{WuffErr, bail_if},
    decompress::read_num_hmetrics,
    sfnt_writer::ReconstructedTable,
    table_tags::{GLYF, HEAD, HHEA, LOCA, MAXP},
    woff::headers::CollectionDirectoryEntry,
};

const HEAD_MIN_LENGTH: usize = 54;
const HEAD_MAGIC_NUMBER: u32 = 0x5F0F3CF5;
const HEAD_MAGIC_OFFSET: usize = 12;
const HEAD_INDEX_TO_LOC_FORMAT_OFFSET: usize = 50;
const MAXP_NUM_GLYPHS_OFFSET: usize = 4;

fn table_data<'t>(
    tables: &'t [Option<ReconstructedTable>],
    table_idx: Option<u16>,
) -> Option<&'t [u8]> {
    table_idx
        .and_then(|idx| tables.get(idx as usize))
        .and_then(Option::as_ref)
        .map(|table| table.data.as_ref())
}

fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let mut field = data.get(offset..offset + 2)?;
    Some(field.get_u16())
}

/// Check that head, maxp, hhea, glyf and loca of one font agree with each other
pub(crate) fn check_font(
    font: &CollectionDirectoryEntry,
    tables: &[Option<ReconstructedTable>],
) -> Result<(), WuffErr> {
    let head = table_data(tables, font.head_idx);
    if let Some(head) = head {
        bail_if!(
            head.len() < HEAD_MIN_LENGTH,
            WuffErr::layout(HEAD, "table is too short")
        );
        let magic = (&head[HEAD_MAGIC_OFFSET..]).get_u32();
        bail_if!(
            magic != HEAD_MAGIC_NUMBER,
            WuffErr::layout(HEAD, "bad magic number")
        );
    }

    let mut num_glyphs: Option<u16> = None;

    if let Some(maxp) = table_data(tables, font.maxp_idx) {
        let maxp_num_glyphs = read_u16_at(maxp, MAXP_NUM_GLYPHS_OFFSET)
            .ok_or(WuffErr::layout(MAXP, "table is too short"))?;
        num_glyphs = Some(maxp_num_glyphs);
    }

    if let Some(loca_idx) = font.loca_idx {
        let glyf = table_data(tables, font.glyf_idx).unwrap_or_default();
        let loca = table_data(tables, Some(loca_idx)).unwrap_or_default();
        let loca_format = tables
            .get(loca_idx as usize)
            .and_then(Option::as_ref)
            .and_then(|table| table.loca_format);

        let head = head.ok_or(WuffErr::layout(HEAD, "required by loca table"))?;
        let index_to_loc_format = read_u16_at(head, HEAD_INDEX_TO_LOC_FORMAT_OFFSET)
            .ok_or(WuffErr::layout(HEAD, "table is too short"))?;
        bail_if!(
            index_to_loc_format > 1,
            WuffErr::layout(HEAD, "indexToLocFormat must be 0 or 1")
        );
        if let Some(loca_format) = loca_format {
            bail_if!(
                loca_format != index_to_loc_format,
                WuffErr::layout(HEAD, "indexToLocFormat does not match loca format")
            );
        }

        let loca_glyphs = check_loca(loca, index_to_loc_format, glyf.len())?;
        if let Some(maxp_num_glyphs) = num_glyphs {
            bail_if!(
                maxp_num_glyphs as usize != loca_glyphs,
                WuffErr::layout(MAXP, "numGlyphs does not match loca table")
            );
        }
    }

    if let Some(hhea) = table_data(tables, font.hhea_idx) {
        let num_hmetrics = read_num_hmetrics(hhea)?;
        if let Some(num_glyphs) = num_glyphs {
            bail_if!(
                num_hmetrics > num_glyphs,
                WuffErr::layout(HHEA, "numberOfHMetrics exceeds numGlyphs")
            );
        }
    }

    Ok(())
}

/// Check that loca offsets are in order and end at the end of glyf. Returns the number of glyphs.
fn check_loca(mut loca: &[u8], index_format: u16, glyf_length: usize) -> Result<usize, WuffErr> {
    let offset_size = if index_format == 0 { 2 } else { 4 };
    bail_if!(
        loca.len() % offset_size != 0 || loca.len() < offset_size,
        WuffErr::layout(LOCA, "table size does not match indexToLocFormat")
    );
    let num_entries = loca.len() / offset_size;

    let mut last_offset: usize = 0;
    while loca.has_remaining() {
        let offset = if index_format == 0 {
            loca.get_u16() as usize * 2
        } else {
            loca.get_u32() as usize
        };
        bail_if!(
            offset < last_offset,
            WuffErr::layout(LOCA, "offsets must be non-decreasing")
        );
        last_offset = offset;
    }
    bail_if!(
        last_offset != glyf_length,
        WuffErr::layout(GLYF, "last loca offset must equal glyf length")
    );

    Ok(num_entries - 1)
}
