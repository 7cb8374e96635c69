use bytes::{Buf, BufMut};

use crate::{
    error::{WuffErr, bail_if},
    table_tags::HMTX,
};

const FLAG_PROPORTIONAL_LSBS_OMITTED: u8 = 1 << 0;
const FLAG_MONOSPACE_LSBS_OMITTED: u8 = 1 << 1;
const RESERVED_FLAGS: u8 = 0xFC;

pub struct HmtxData {
    pub num_glyphs: u16,
    pub num_hmetrics: u16,
    pub advance_widths: Vec<u16>,
    /// Left side bearings of every glyph, proportional and monospace alike
    pub lsbs: Vec<i16>,
}

/// Decode a WOFF2 transformed hmtx table
///
/// Omitted left side bearings are recovered from the xMin of each glyph's bounding box, which is
/// why this needs the reconstructed `glyf` table's `x_mins`.
///
/// <https://www.w3.org/TR/WOFF2/#hmtx_table_format>
pub(crate) fn decode_hmtx_table(
    mut input: &[u8],
    num_hmetrics: u16,
    x_mins: &[i16],
) -> Result<HmtxData, WuffErr> {
    // Decode flags
    let hmtx_flags: u8 = input.try_get_u8()?;
    let has_proportional_lsbs: bool = (hmtx_flags & FLAG_PROPORTIONAL_LSBS_OMITTED) == 0;
    let has_monospace_lsbs: bool = (hmtx_flags & FLAG_MONOSPACE_LSBS_OMITTED) == 0;

    // Bits 2-7 are reserved and MUST be zero.
    bail_if!(
        (hmtx_flags & RESERVED_FLAGS) != 0,
        WuffErr::transform(HMTX, "reserved flags must be zero")
    );

    // you say you transformed but there is little evidence of it
    bail_if!(
        has_proportional_lsbs && has_monospace_lsbs,
        WuffErr::transform(HMTX, "transform must omit at least one lsb array")
    );

    let num_glyphs = u16::try_from(x_mins.len())
        .map_err(|_| WuffErr::transform(HMTX, "too many glyphs"))?;

    // num_glyphs 0 is OK if there is no 'glyf' but cannot then xform 'hmtx'.
    bail_if!(
        num_hmetrics > num_glyphs,
        WuffErr::transform(HMTX, "numberOfHMetrics exceeds number of glyphs")
    );

    // "...only one entry need be in the array, but that entry is required."
    // <https://www.microsoft.com/typography/otspec/hmtx.htm>
    bail_if!(
        num_hmetrics < 1,
        WuffErr::transform(HMTX, "numberOfHMetrics must be at least one")
    );

    // Read advance widths
    let mut advance_widths: Vec<u16> = Vec::with_capacity(num_hmetrics as usize);
    for _ in 0..num_hmetrics {
        advance_widths.push(input.try_get_u16()?);
    }

    // Read lsb (proportional) and leftSideBearing (monospace) values into the same Vec
    let mut lsbs: Vec<i16> = Vec::with_capacity(num_glyphs as usize);
    for &x_min in &x_mins[..num_hmetrics as usize] {
        lsbs.push(match has_proportional_lsbs {
            true => input.try_get_i16()?,
            false => x_min,
        });
    }
    for &x_min in &x_mins[num_hmetrics as usize..] {
        lsbs.push(match has_monospace_lsbs {
            true => input.try_get_i16()?,
            false => x_min,
        });
    }

    bail_if!(
        input.has_remaining(),
        WuffErr::transform(HMTX, "trailing data after transformed table")
    );

    log::debug!(
        "hmtx: reconstructed {num_hmetrics} metrics for {num_glyphs} glyphs (flags {hmtx_flags:#04x})"
    );

    Ok(HmtxData {
        num_glyphs,
        num_hmetrics,
        advance_widths,
        lsbs,
    })
}

/// bake me a shiny new hmtx table
pub(crate) fn generate_hmtx_table(hmtx_data: &HmtxData) -> Vec<u8> {
    let num_glyphs = hmtx_data.num_glyphs as usize;
    let num_hmetrics = hmtx_data.num_hmetrics as usize;

    let hmtx_output_size: usize = 2 * num_glyphs + 2 * num_hmetrics;
    let mut hmtx_table: Vec<u8> = Vec::with_capacity(hmtx_output_size);
    for (i, &lsb) in hmtx_data.lsbs.iter().enumerate() {
        if let Some(&advance_width) = hmtx_data.advance_widths.get(i) {
            hmtx_table.put_u16(advance_width);
        }
        hmtx_table.put_i16(lsb);
    }

    hmtx_table
}
