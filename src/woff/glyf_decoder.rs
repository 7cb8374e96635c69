use arrayvec::ArrayVec;
use bytes::{Buf, BufMut};

use crate::{
    Point, Round4,
    error::{WuffErr, bail, bail_if, u32_will_overflow},
    table_tags::{GLYF, LOCA},
    variable_length::{BufVariableExt as _, split_off},
};

// simple glyph flags
const GLYF_ON_CURVE: u8 = 1 << 0;
const GLYF_X_SHORT: u8 = 1 << 1;
const GLYF_Y_SHORT: u8 = 1 << 2;
const GLYF_REPEAT: u8 = 1 << 3;
const GLYF_THIS_X_IS_SAME: u8 = 1 << 4;
const GLYF_THIS_Y_IS_SAME: u8 = 1 << 5;
const OVERLAP_SIMPLE: u8 = 1 << 6;

const NUM_SUB_STREAMS: usize = 7;
const TRANSFORM_HEADER_SIZE: usize = (2 + NUM_SUB_STREAMS) * 4;
const FLAG_OVERLAP_SIMPLE_BITMAP: u16 = 1 << 0;
// 98% of Google Fonts have no glyph above 5k bytes. Largest glyph ever observed was 72k bytes
const DEFAULT_GLYPH_BUF_SIZE: usize = 5120;

const FLAG_ARG_1_AND_2_ARE_WORDS: u16 = 1 << 0;
const FLAG_WE_HAVE_A_SCALE: u16 = 1 << 3;
const FLAG_MORE_COMPONENTS: u16 = 1 << 5;
const FLAG_WE_HAVE_AN_X_AND_Y_SCALE: u16 = 1 << 6;
const FLAG_WE_HAVE_A_TWO_BY_TWO: u16 = 1 << 7;
const FLAG_WE_HAVE_INSTRUCTIONS: u16 = 1 << 8;

/// Largest glyph offset a short loca can express
const MAX_SHORT_LOCA_OFFSET: usize = 0x1FFFE;

pub struct GlyfAndLocaData {
    /// The number of glyphs in the glyf table
    pub num_glyphs: u16,
    /// loca index format
    pub index_format: u16,
    /// The x_min of the bounding box of each glyph (0 for empty glyphs). Used to reconstruct hmtx table
    pub x_mins: Vec<i16>,
    /// Encoded Open Type "glyf" table
    pub glyf_table: Vec<u8>,
    /// Encoded Open Type "loca" table
    pub loca_table: Vec<u8>,
}

impl GlyfAndLocaData {
    /// Size of the loca table implied by the index format and glyph count
    pub fn expected_loca_length(&self) -> usize {
        let offset_size = if self.index_format != 0 { 4 } else { 2 };
        offset_size * (self.num_glyphs as usize + 1)
    }
}

/// Decode a WOFF2 transformed glyf table, producing both glyf and loca
///
/// <https://www.w3.org/TR/WOFF2/#glyf_table_format>
pub(crate) fn decode_glyf_table(data: &[u8]) -> Result<GlyfAndLocaData, WuffErr> {
    GlyfDecoder::new(data)?.transform()
}

pub struct GlyfDecoder<'a> {
    // State
    n_contour_stream: &'a [u8],
    n_points_stream: &'a [u8],
    flag_stream: &'a [u8],
    glyph_stream: &'a [u8],
    composite_stream: &'a [u8],
    bbox_bitmap: &'a [u8],
    bbox_stream: &'a [u8],
    instruction_stream: &'a [u8],
    overlap_bitmap: Option<&'a [u8]>,
    glyph_buf: Vec<u8>,
    points: Vec<Point>,

    // Output data
    num_glyphs: u16,
    index_format: u16,
}

fn bit_is_set(bitmap: &[u8], index: usize) -> bool {
    (bitmap[index >> 3] & (0x80 >> (index & 7))) != 0
}

impl GlyfDecoder<'_> {
    pub fn new<'a>(data: &'a [u8]) -> Result<GlyfDecoder<'a>, WuffErr> {
        bail_if!(
            data.len() < TRANSFORM_HEADER_SIZE,
            WuffErr::transform(GLYF, "transformed table header is truncated")
        );

        let mut input = data;
        let _: u16 = input.try_get_u16()?; // first 2 bytes are reserved
        let flags: u16 = input.try_get_u16()?;
        let has_overlap_bitmap: bool = (flags & FLAG_OVERLAP_SIMPLE_BITMAP) != 0;
        let num_glyphs = input.try_get_u16()?;
        let index_format = input.try_get_u16()?;
        bail_if!(
            index_format > 1,
            WuffErr::transform(GLYF, "indexFormat must be 0 or 1")
        );

        // The stream sizes are read from the header, the streams themselves follow it
        let mut streams = &data[TRANSFORM_HEADER_SIZE..];
        let mut substreams: ArrayVec<&[u8], NUM_SUB_STREAMS> = ArrayVec::new();
        for _ in 0..NUM_SUB_STREAMS {
            let substream_size: usize = input.try_get_u32()? as usize;
            bail_if!(
                substream_size > streams.len(),
                WuffErr::transform(GLYF, "sub-stream exceeds table length")
            );
            substreams.push(split_off(&mut streams, substream_size)?);
        }

        // Safe because num_glyphs is bounded
        let bitmap_length: usize = ((num_glyphs as usize + 31) >> 5) << 2;
        bail_if!(
            bitmap_length > substreams[5].len(),
            WuffErr::transform(GLYF, "bbox bitmap exceeds bbox stream")
        );

        let n_contour_stream = substreams[0];
        let n_points_stream = substreams[1];
        let flag_stream = substreams[2];
        let glyph_stream = substreams[3];
        let composite_stream = substreams[4];
        let (bbox_bitmap, bbox_stream) = substreams[5].split_at(bitmap_length);
        let instruction_stream = substreams[6];

        let mut overlap_bitmap: Option<&[u8]> = None;
        if has_overlap_bitmap {
            let overlap_bitmap_length = (num_glyphs as usize + 7) >> 3;
            bail_if!(
                overlap_bitmap_length > streams.len(),
                WuffErr::transform(GLYF, "overlap bitmap exceeds table length")
            );
            overlap_bitmap = Some(&streams[..overlap_bitmap_length]);
        }

        // Scratch buffer to decode glyphs into.
        let glyph_buf: Vec<u8> = Vec::with_capacity(DEFAULT_GLYPH_BUF_SIZE);

        Ok(GlyfDecoder {
            n_contour_stream,
            n_points_stream,
            flag_stream,
            glyph_stream,
            composite_stream,
            bbox_bitmap,
            bbox_stream,
            instruction_stream,
            overlap_bitmap,
            glyph_buf,
            points: Vec::new(),
            num_glyphs,
            index_format,
        })
    }

    pub fn transform(mut self) -> Result<GlyfAndLocaData, WuffErr> {
        // Setup state
        let mut glyf_table: Vec<u8> = Vec::with_capacity(self.num_glyphs as usize * 12);
        let mut loca_values: Vec<usize> = Vec::with_capacity(self.num_glyphs as usize + 1);
        let mut x_mins: Vec<i16> = Vec::with_capacity(self.num_glyphs as usize);

        // Iterate over each glyph
        for i in 0..(self.num_glyphs as usize) {
            loca_values.push(glyf_table.len());

            let n_contours: i16 = self.n_contour_stream.try_get_i16()?;
            let glyph_has_bbox = bit_is_set(self.bbox_bitmap, i);

            self.glyph_buf.clear();
            if n_contours == -1 {
                // composite glyphs must have an explicit bbox
                bail_if!(
                    !glyph_has_bbox,
                    WuffErr::transform(GLYF, "composite glyph must have a bbox")
                );
                self.parse_composite_glyph()?;
            } else if n_contours > 0 {
                // Note: while this look similar to the glyph_has_bbox code above, it's indexing into a different bitmap
                let has_overlap_bit: bool = self
                    .overlap_bitmap
                    .is_some_and(|bitmap| bit_is_set(bitmap, i));
                self.parse_simple_glyph(n_contours, glyph_has_bbox, has_overlap_bit)?;
            } else if n_contours == 0 {
                // Empty glyph. Must NOT have a bbox.
                bail_if!(
                    glyph_has_bbox,
                    WuffErr::transform(GLYF, "empty glyph must not have a bbox")
                );
            } else {
                bail!(WuffErr::transform(GLYF, "invalid number of contours"));
            }

            // The x_min value is an i16 stored as bytes 2-4 in the glyph header.
            // We keep it in case we need it to reconstruct 'hmtx'.
            let x_min = match self.glyph_buf.get(2..4) {
                Some(&[hi, lo]) => i16::from_be_bytes([hi, lo]),
                _ => 0,
            };
            x_mins.push(x_min);

            // Write glyph to output table and pad output
            glyf_table.extend_from_slice(&self.glyph_buf);
            glyf_table.resize(Round4!(glyf_table.len()), 0);
        }

        // loca[n] will be equal the length of the glyph data ('glyf') table
        loca_values.push(glyf_table.len());

        // Generate loca table
        let loca_table = generate_loca_table(&loca_values, self.index_format)?;

        log::debug!(
            "glyf: reconstructed {} glyphs ({} bytes, {} loca)",
            self.num_glyphs,
            glyf_table.len(),
            if self.index_format == 0 { "short" } else { "long" }
        );

        Ok(GlyfAndLocaData {
            num_glyphs: self.num_glyphs,
            index_format: self.index_format,
            x_mins,
            loca_table,
            glyf_table,
        })
    }

    /// Parse glyph data into `self.glyph_buf`
    fn parse_composite_glyph(&mut self) -> Result<(), WuffErr> {
        // Create a new iterator over the composite stream when computing the size so that we
        // we can "rewind" and copy the bytes counted here below.
        let mut ro_composite_stream = self.composite_stream;
        let (composite_size, have_instructions) =
            compute_size_of_composite(&mut ro_composite_stream)?;

        let instruction_size: u16 = if have_instructions {
            self.glyph_stream.try_get_variable_255_u16()?
        } else {
            0
        };

        let size_needed: usize = 12 + composite_size + (instruction_size as usize);
        self.glyph_buf.reserve(size_needed);

        let n_contours: i16 = -1; // All composite glyphs has n_contours = -1
        self.glyph_buf.put_i16(n_contours);

        self.bbox_stream
            .try_read_bytes_into(8, &mut self.glyph_buf)?;
        self.composite_stream
            .try_read_bytes_into(composite_size, &mut self.glyph_buf)?;

        if have_instructions {
            self.glyph_buf.put_u16(instruction_size);
            self.instruction_stream
                .try_read_bytes_into(instruction_size as usize, &mut self.glyph_buf)?;
        }

        Ok(())
    }

    fn parse_simple_glyph(
        &mut self,
        n_contours: i16,
        glyph_has_bbox: bool,
        has_overlap_bit: bool,
    ) -> Result<(), WuffErr> {
        let n_contours = n_contours as usize;

        // simple glyph
        let mut n_points_vec: Vec<u16> = Vec::with_capacity(n_contours);
        let mut total_n_points: u32 = 0;
        for _ in 0..n_contours {
            let n_points_contour: u16 = self.n_points_stream.try_get_variable_255_u16()?;
            n_points_vec.push(n_points_contour);
            bail_if!(
                u32_will_overflow(total_n_points, n_points_contour as u32),
                WuffErr::overflow(GLYF, "too many points")
            );
            total_n_points += n_points_contour as u32;
        }
        // End points are stored as u16, so the last point index must fit in one
        bail_if!(
            total_n_points > 0x10000,
            WuffErr::overflow(GLYF, "too many points")
        );

        let flags = split_off(&mut self.flag_stream, total_n_points as usize)?;
        self.points.clear();
        decode_triplet(flags, &mut self.glyph_stream, &mut self.points)?;

        let instruction_size: u16 = self.glyph_stream.try_get_variable_255_u16()?;

        // Reserve needed size to reduce allocations
        let size_needed: usize =
            12 + 2 * n_contours + 5 * (total_n_points as usize) + (instruction_size as usize);
        self.glyph_buf.reserve(size_needed);

        self.glyph_buf.put_i16(n_contours as i16);

        if glyph_has_bbox {
            self.bbox_stream
                .try_read_bytes_into(8, &mut self.glyph_buf)?;
        } else {
            write_bbox(self.points.as_slice(), &mut self.glyph_buf);
        }

        let mut end_point: i32 = -1;
        for contour in n_points_vec {
            end_point += contour as i32;
            bail_if!(
                !(0..65536).contains(&end_point),
                WuffErr::overflow(GLYF, "too many points")
            );
            self.glyph_buf.put_u16(end_point as u16);
        }

        self.glyph_buf.put_u16(instruction_size);
        self.instruction_stream
            .try_read_bytes_into(instruction_size as usize, &mut self.glyph_buf)?;

        write_glyph_points(self.points.as_slice(), has_overlap_bit, &mut self.glyph_buf);

        Ok(())
    }
}

fn point_flag(point: &Point, dx: i32, dy: i32) -> u8 {
    let mut flag: u8 = 0;
    if point.on_curve {
        flag |= GLYF_ON_CURVE;
    }

    // Handle x
    if dx == 0 {
        flag |= GLYF_THIS_X_IS_SAME;
    } else if dx > -256 && dx < 256 {
        flag |= GLYF_X_SHORT | (if dx > 0 { GLYF_THIS_X_IS_SAME } else { 0 });
    }

    // Handle y
    if dy == 0 {
        flag |= GLYF_THIS_Y_IS_SAME;
    } else if dy > -256 && dy < 256 {
        flag |= GLYF_Y_SHORT | (if dy > 0 { GLYF_THIS_Y_IS_SAME } else { 0 });
    }

    flag
}

/// Write the flags, x coordinates and y coordinates of a simple glyph
fn write_glyph_points(points: &[Point], has_overlap_bit: bool, dst: &mut Vec<u8>) {
    // Write flags
    //
    // Each flag is written as soon as it is computed. When a flag equals the previous one we
    // instead set GLYF_REPEAT on the flag already in the buffer and count the repeat; the
    // count byte is written once the run ends (or reaches the 255 limit of a single byte).
    let mut last_flag: Option<u8> = None;
    let mut last_flag_pos: usize = 0;
    let mut repeat_count: u8 = 0;
    let mut last_x: i32 = 0;
    let mut last_y: i32 = 0;
    for (i, point) in points.iter().enumerate() {
        let mut flag = point_flag(point, point.x - last_x, point.y - last_y);
        if has_overlap_bit && i == 0 {
            flag |= OVERLAP_SIMPLE;
        }

        if last_flag == Some(flag) && repeat_count < 255 {
            dst[last_flag_pos] |= GLYF_REPEAT;
            repeat_count += 1;
        } else {
            if repeat_count != 0 {
                dst.put_u8(repeat_count);
            }
            last_flag_pos = dst.len();
            dst.put_u8(flag);
            repeat_count = 0;
        }

        last_x = point.x;
        last_y = point.y;
        last_flag = Some(flag);
    }
    if repeat_count != 0 {
        dst.put_u8(repeat_count);
    }

    // Write x coordinates
    last_x = 0;
    for point in points {
        let dx: i32 = point.x - last_x;
        if dx == 0 {
            // do nothing
        } else if dx > -256 && dx < 256 {
            dst.put_u8(dx.unsigned_abs() as u8);
        } else {
            // Both coordinates fit in i16, so the truncated delta still sums to the right value
            dst.put_i16(dx as i16)
        }
        last_x = point.x;
    }

    // Write y coordinates
    last_y = 0;
    for point in points {
        let dy: i32 = point.y - last_y;
        if dy == 0 {
            // do nothing
        } else if dy > -256 && dy < 256 {
            dst.put_u8(dy.unsigned_abs() as u8);
        } else {
            dst.put_i16(dy as i16)
        }
        last_y = point.y;
    }
}

/// Compute the bounding box of the coordinates, and store into a glyf buffer.
fn write_bbox(points: &[Point], dst: &mut impl BufMut) {
    let mut x_min: i32 = 0;
    let mut y_min: i32 = 0;
    let mut x_max: i32 = 0;
    let mut y_max: i32 = 0;

    if let Some(first) = points.first() {
        x_min = first.x;
        x_max = first.x;
        y_min = first.y;
        y_max = first.y;
    }
    for &Point { x, y, .. } in points.iter().skip(1) {
        x_min = x.min(x_min);
        x_max = x.max(x_max);
        y_min = y.min(y_min);
        y_max = y.max(y_max);
    }

    // Points are range checked in decode_triplet
    dst.put_i16(x_min as i16);
    dst.put_i16(y_min as i16);
    dst.put_i16(x_max as i16);
    dst.put_i16(y_max as i16);
}

fn compute_size_of_composite(composite_stream: &mut impl Buf) -> Result<(usize, bool), WuffErr> {
    let mut bytes_read: usize = 0;
    let mut we_have_instructions: bool = false;
    let mut flags: u16 = FLAG_MORE_COMPONENTS;
    while flags & FLAG_MORE_COMPONENTS != 0 {
        flags = composite_stream.try_get_u16()?;
        we_have_instructions |= (flags & FLAG_WE_HAVE_INSTRUCTIONS) != 0;
        let mut arg_size: usize = 2; // glyph index
        if flags & FLAG_ARG_1_AND_2_ARE_WORDS != 0 {
            arg_size += 4;
        } else {
            arg_size += 2;
        }
        if flags & FLAG_WE_HAVE_A_SCALE != 0 {
            arg_size += 2;
        } else if flags & FLAG_WE_HAVE_AN_X_AND_Y_SCALE != 0 {
            arg_size += 4;
        } else if flags & FLAG_WE_HAVE_A_TWO_BY_TWO != 0 {
            arg_size += 8;
        }
        composite_stream.try_skip(arg_size)?;

        // 2 bytes for the flags + arg_size
        bytes_read += 2 + arg_size
    }

    Ok((bytes_read, we_have_instructions))
}

/// Decode one triplet-encoded point per flag, consuming the coordinate bytes from `glyph_stream`
///
/// <https://www.w3.org/TR/WOFF2/#triplet_decoding>
fn decode_triplet(
    flags_in: &[u8],
    glyph_stream: &mut &[u8],
    result: &mut Vec<Point>,
) -> Result<(), WuffErr> {
    #[inline(always)]
    fn with_sign(flag: i32, baseval: i32) -> i32 {
        // Precondition: 0 <= baseval < 65536 (to avoid integer overflow)
        if (flag & 1) != 0 { baseval } else { -baseval }
    }

    #[inline(always)]
    fn checked_coordinate(a: i32, b: i32) -> Result<i32, WuffErr> {
        // |a| and |b| are both below 2^16 so this can't overflow an i32
        let sum = a + b;
        bail_if!(
            sum < i16::MIN as i32 || sum > i16::MAX as i32,
            WuffErr::overflow(GLYF, "coordinate out of range")
        );
        Ok(sum)
    }

    let mut x: i32 = 0;
    let mut y: i32 = 0;

    result.reserve(flags_in.len());
    for &flag in flags_in {
        let on_curve: bool = (flag >> 7) == 0;
        let flag = (flag & 0x7f) as i32;

        let n_data_bytes: usize = if flag < 84 {
            1
        } else if flag < 120 {
            2
        } else if flag < 124 {
            3
        } else {
            4
        };
        let data = split_off(glyph_stream, n_data_bytes)?;

        let dx: i32;
        let dy: i32;
        if flag < 10 {
            dx = 0;
            dy = with_sign(flag, ((flag & 14) << 7) + data[0] as i32);
        } else if flag < 20 {
            dx = with_sign(flag, (((flag - 10) & 14) << 7) + data[0] as i32);
            dy = 0;
        } else if flag < 84 {
            let b0: i32 = flag - 20;
            let b1: i32 = data[0] as i32;
            dx = with_sign(flag, 1 + (b0 & 0x30) + (b1 >> 4));
            dy = with_sign(flag >> 1, 1 + ((b0 & 0x0c) << 2) + (b1 & 0x0f));
        } else if flag < 120 {
            let b0: i32 = flag - 84;
            dx = with_sign(flag, 1 + ((b0 / 12) << 8) + data[0] as i32);
            dy = with_sign(flag >> 1, 1 + (((b0 % 12) >> 2) << 8) + data[1] as i32);
        } else if flag < 124 {
            let b2: i32 = data[1] as i32;
            dx = with_sign(flag, ((data[0] as i32) << 4) + (b2 >> 4));
            dy = with_sign(flag >> 1, ((b2 & 0x0f) << 8) + data[2] as i32);
        } else {
            dx = with_sign(flag, ((data[0] as i32) << 8) + data[1] as i32);
            dy = with_sign(flag >> 1, ((data[2] as i32) << 8) + data[3] as i32);
        }
        x = checked_coordinate(x, dx)?;
        y = checked_coordinate(y, dy)?;

        result.push(Point { x, y, on_curve });
    }

    Ok(())
}

/// Generate a loca table given a slice of glyph offsets and an index format
///
/// See <https://developer.apple.com/fonts/TrueType-Reference-Manual/RM06/Chap6loca.html>
pub(crate) fn generate_loca_table(
    loca_values: &[usize],
    index_format: u16,
) -> Result<Vec<u8>, WuffErr> {
    let offset_size: usize = if index_format != 0 { 4 } else { 2 };
    let mut loca_content: Vec<u8> = Vec::with_capacity(loca_values.len() * offset_size);
    if index_format != 0 {
        for &value in loca_values {
            // loca long version. The actual local offset is stored.
            let value = u32::try_from(value)
                .map_err(|_| WuffErr::overflow(LOCA, "glyph offset out of range"))?;
            loca_content.put_u32(value);
        }
    } else {
        for &value in loca_values {
            // loca short version. The actual local offset divided by 2 is stored.
            bail_if!(
                value > MAX_SHORT_LOCA_OFFSET,
                WuffErr::overflow(LOCA, "glyph offset out of range for short loca")
            );
            loca_content.put_u16((value >> 1) as u16);
        }
    }

    Ok(loca_content)
}
