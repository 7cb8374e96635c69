use std::{borrow::Cow, collections::HashMap, error::Error};

use bytes::Buf as _;

use crate::{
    consistency,
    error::{WuffErr, bail, bail_if},
    sfnt_writer::{ReconstructedTable, write_sfnt},
    table_tags::{GLYF, HHEA, HMTX, LOCA},
    variable_length::BufVariableExt as _,
    woff::{
        glyf_decoder::decode_glyf_table,
        headers::{CollectionDirectory, TableTransform, Woff2, Woff2TableDirectory},
        hmtx_decoder::{decode_hmtx_table, generate_hmtx_table},
    },
};

// Over 14k test fonts the max compression ratio seen to date was ~20.
// >100 suggests you wrote a bad uncompressed size.
const K_MAX_PLAUSIBLE_COMPRESSION_RATIO: usize = 100;

/// Upper bound on the size of the decompressed font data
pub const MAX_DECOMPRESSED_SIZE: usize = 30 * 1024 * 1024;

/// Offset of numberOfHMetrics in the 'hhea' table
const HHEA_NUM_HMETRICS_OFFSET: usize = 34;

#[cfg(feature = "brotli")]
fn decompress_brotli(compressed_data: &[u8], expected_size: usize) -> Result<Vec<u8>, WuffErr> {
    use brotli_decompressor::{BrotliDecompressStream, BrotliResult, BrotliState, StandardAlloc};

    let mut output: Vec<u8> = vec![0; expected_size];
    let mut state = BrotliState::new(
        StandardAlloc::default(),
        StandardAlloc::default(),
        StandardAlloc::default(),
    );

    let mut available_in = compressed_data.len();
    let mut input_offset = 0;
    let mut available_out = output.len();
    let mut output_offset = 0;
    let mut total_out = 0;
    let result = BrotliDecompressStream(
        &mut available_in,
        &mut input_offset,
        compressed_data,
        &mut available_out,
        &mut output_offset,
        &mut output,
        &mut total_out,
        &mut state,
    );

    match result {
        BrotliResult::ResultSuccess => {}
        // The stream holds more data than the table directory accounts for
        BrotliResult::NeedsMoreOutput => bail!(WuffErr::DecompressedLength {
            expected: expected_size
        }),
        BrotliResult::NeedsMoreInput | BrotliResult::ResultFailure => bail!(WuffErr::Brotli),
    }
    // Trailing bytes after the end of the brotli stream
    bail_if!(available_in != 0, WuffErr::Brotli);
    bail_if!(
        output_offset != expected_size,
        WuffErr::DecompressedLength {
            expected: expected_size
        }
    );

    Ok(output)
}

/// Decode a WOFF2 font (or font collection) into an SFNT (TrueType/OpenType) font or TTC collection
#[cfg(feature = "brotli")]
pub fn decompress_woff2(raw_woff_data: &[u8]) -> Result<Vec<u8>, WuffErr> {
    decode_woff2(raw_woff_data, decompress_brotli)
}

/// Decode a WOFF2 font using a caller-supplied brotli decompressor.
///
/// The closure receives the compressed font data and the exact size it must decompress to.
/// Any error it returns is reported as [`WuffErr::Brotli`].
#[allow(clippy::type_complexity)]
pub fn decompress_woff2_with_custom_brotli(
    raw_woff_data: &[u8],
    decompress_brotli: &mut dyn FnMut(&[u8], usize) -> Result<Vec<u8>, Box<dyn Error>>,
) -> Result<Vec<u8>, WuffErr> {
    decode_woff2(raw_woff_data, |compressed_data, expected_size| {
        let output = decompress_brotli(compressed_data, expected_size).map_err(|err| {
            log::debug!("brotli decompressor failed: {err}");
            WuffErr::Brotli
        })?;
        bail_if!(
            output.len() != expected_size,
            WuffErr::DecompressedLength {
                expected: expected_size
            }
        );
        Ok(output)
    })
}

fn decode_woff2(
    raw_woff_data: &[u8],
    decompress: impl FnOnce(&[u8], usize) -> Result<Vec<u8>, WuffErr>,
) -> Result<Vec<u8>, WuffErr> {
    // Parse header, table directory, collection directory and locate the data blocks
    let woff2 = Woff2::parse(raw_woff_data)?;

    // Re-order tables in output (OTSpec) order
    let mut fonts = woff2.fonts();
    fonts.sort_tables_within_each_font(&woff2.table_directory);

    // Validate the decompressed size (and compression ratio) before allocating for it
    let uncompressed_size = woff2.table_directory.uncompressed_size();
    bail_if!(
        uncompressed_size > MAX_DECOMPRESSED_SIZE,
        WuffErr::Directory("decompressed font data exceeds size limit")
    );
    bail_if!(
        uncompressed_size > raw_woff_data.len().saturating_mul(K_MAX_PLAUSIBLE_COMPRESSION_RATIO),
        WuffErr::Directory("implausible compression ratio")
    );

    let decompressed_data = decompress(woff2.compressed_data, uncompressed_size)?;
    log::debug!(
        "decompressed {} bytes into {} bytes of font data ({} tables, {} fonts)",
        woff2.compressed_data.len(),
        decompressed_data.len(),
        woff2.table_directory.len(),
        fonts.fonts.len()
    );

    let tables = reconstruct_tables(&woff2.table_directory, &fonts, &decompressed_data)?;
    for font in &fonts.fonts {
        consistency::check_font(font, &tables)?;
    }

    write_sfnt(&fonts, woff2.header.is_collection(), &tables)
}

/// Turn every table referenced by a font into its final SFNT bytes.
///
/// The result is indexed like the table directory. Tables shared between the fonts of a
/// collection are reconstructed once. The table indices of each font must be sorted by tag
/// so that glyf is handled before loca and hmtx.
pub(crate) fn reconstruct_tables<'a>(
    tables: &Woff2TableDirectory,
    fonts: &CollectionDirectory,
    woff_data: &'a [u8],
) -> Result<Vec<Option<ReconstructedTable<'a>>>, WuffErr> {
    let mut reconstructed: Vec<Option<ReconstructedTable<'a>>> =
        (0..tables.len()).map(|_| None).collect();

    // x_min of every glyph, by the table index of the transformed glyf they came from
    let mut glyf_x_mins: HashMap<usize, Vec<i16>> = HashMap::new();

    for font in &fonts.fonts {
        for &table_idx in &font.table_indices {
            let table_idx = table_idx as usize;
            if reconstructed[table_idx].is_some() {
                continue;
            }

            let table = &tables[table_idx];
            let table_data = table.data_as_slice(woff_data)?;
            let output = match table.transform() {
                TableTransform::Raw => ReconstructedTable::raw(table.tag, table_data),
                TableTransform::GlyfLoca if table.tag == GLYF => {
                    let loca_idx = font
                        .loca_idx
                        .map(|idx| idx as usize)
                        .ok_or(WuffErr::GlyfLocaMismatch)?;
                    // A transformed loca belongs to exactly one glyf
                    bail_if!(reconstructed[loca_idx].is_some(), WuffErr::GlyfLocaMismatch);
                    let glyf_and_loca = decode_glyf_table(table_data)?;

                    // https://www.w3.org/TR/WOFF2/#conform-mustRejectLoca
                    bail_if!(
                        tables[loca_idx].orig_length as usize
                            != glyf_and_loca.expected_loca_length(),
                        WuffErr::transform(LOCA, "origLength does not match number of glyphs")
                    );

                    reconstructed[loca_idx] = Some(ReconstructedTable {
                        tag: LOCA,
                        data: Cow::Owned(glyf_and_loca.loca_table),
                        loca_format: Some(glyf_and_loca.index_format),
                        is_transformed_glyf: false,
                    });
                    glyf_x_mins.insert(table_idx, glyf_and_loca.x_mins);

                    ReconstructedTable {
                        tag: GLYF,
                        data: Cow::Owned(glyf_and_loca.glyf_table),
                        loca_format: None,
                        is_transformed_glyf: true,
                    }
                }
                // A transformed loca is produced together with its glyf, which sorts before it
                TableTransform::GlyfLoca => bail!(WuffErr::GlyfLocaMismatch),
                TableTransform::Hmtx => {
                    let x_mins = font
                        .glyf_idx
                        .and_then(|idx| glyf_x_mins.get(&(idx as usize)))
                        .ok_or(WuffErr::transform(
                            HMTX,
                            "transformed hmtx requires a transformed glyf table",
                        ))?;
                    let hhea_idx = font.hhea_idx.ok_or(WuffErr::transform(
                        HMTX,
                        "transformed hmtx requires an hhea table",
                    ))?;
                    let num_hmetrics =
                        read_num_hmetrics(tables[hhea_idx as usize].data_as_slice(woff_data)?)?;

                    let hmtx_data = decode_hmtx_table(table_data, num_hmetrics, x_mins)?;
                    ReconstructedTable::owned(HMTX, generate_hmtx_table(&hmtx_data))
                }
            };

            log::debug!(
                "{}: {:?} table, {} bytes in stream, {} bytes reconstructed",
                table.tag,
                table.transform(),
                table.woff_length,
                output.data.len()
            );
            reconstructed[table_idx] = Some(output);
        }
    }

    Ok(reconstructed)
}

// Get numberOfHMetrics, https://www.microsoft.com/typography/otspec/hhea.htm
pub(crate) fn read_num_hmetrics(mut hhea_data: &[u8]) -> Result<u16, WuffErr> {
    bail_if!(
        hhea_data.len() < HHEA_NUM_HMETRICS_OFFSET + 2,
        WuffErr::layout(HHEA, "table is too short")
    );
    hhea_data.try_skip(HHEA_NUM_HMETRICS_OFFSET)?; // Skip 34 to reach 'hhea' numberOfHMetrics
    Ok(hhea_data.try_get_u16()?)
}
