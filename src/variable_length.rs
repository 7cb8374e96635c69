/* Copyright 2015 Google Inc. All Rights Reserved.

   Distributed under MIT license.
   See file LICENSE for detail or copy at https://opensource.org/licenses/MIT
*/

//! Helper functions for woff2 variable length types: 255UInt16 and UIntBase128

use arrayvec::ArrayVec;
use bytes::{Buf, BufMut};

use crate::error::{WuffErr, bail, bail_if};

const WORD_CODE: u8 = 253;
const ONE_MORE_BYTE_CODE2: u8 = 254;
const ONE_MORE_BYTE_CODE1: u8 = 255;
const LOWEST_U_CODE: u16 = 253;

/// Bounds-checked reads of the WOFF2 packed integer types on top of [`bytes::Buf`]
pub trait BufVariableExt: Buf {
    /// Read a 255UInt16
    ///
    /// Based on section 6.1.1 of MicroType Express draft spec
    fn try_get_variable_255_u16(&mut self) -> Result<u16, WuffErr> {
        let code = self.try_get_u8()?;
        match code {
            WORD_CODE => Ok(self.try_get_u16()?),
            ONE_MORE_BYTE_CODE1 => Ok(self.try_get_u8()? as u16 + LOWEST_U_CODE),
            ONE_MORE_BYTE_CODE2 => Ok(self.try_get_u8()? as u16 + LOWEST_U_CODE * 2),
            _ => Ok(code as u16),
        }
    }

    /// Read a UIntBase128
    ///
    /// <https://www.w3.org/TR/WOFF2/#DataTypes>
    fn try_get_variable_128_u32(&mut self) -> Result<u32, WuffErr> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let code = self.try_get_u8()?;
            // Leading zeros are invalid.
            bail_if!(
                i == 0 && code == 0x80,
                WuffErr::Directory("UIntBase128 value has leading zeros")
            );
            // If any of the top seven bits are set then we're about to overflow.
            bail_if!(
                (result & 0xfe000000) != 0,
                WuffErr::Directory("UIntBase128 value overflows 32 bits")
            );
            result = (result << 7) | ((code & 0x7f) as u32);
            if (code & 0x80) == 0 {
                return Ok(result);
            }
        }
        // Make sure not to exceed the size bound
        bail!(WuffErr::Directory("UIntBase128 value exceeds 5 bytes"))
    }

    /// Skip `len` bytes, failing instead of panicking when fewer remain
    fn try_skip(&mut self, len: usize) -> Result<(), WuffErr> {
        bail_if!(self.remaining() < len, WuffErr::Truncated);
        self.advance(len);
        Ok(())
    }

    /// Copy `len` bytes to the end of `dst`
    fn try_read_bytes_into(&mut self, len: usize, dst: &mut impl BufMut) -> Result<(), WuffErr> {
        bail_if!(self.remaining() < len, WuffErr::Truncated);
        dst.put(self.take(len));
        Ok(())
    }
}

impl<T: Buf + ?Sized> BufVariableExt for T {}

/// Split the first `len` bytes off the front of `input` without copying
pub fn split_off<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], WuffErr> {
    bail_if!(input.len() < len, WuffErr::Truncated);
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

/// Writes of the WOFF2 packed integer types on top of [`bytes::BufMut`]
pub trait BufMutVariableExt: BufMut {
    fn put_variable_255_u16(&mut self, value: u16) {
        let mut packed: ArrayVec<u8, 3> = ArrayVec::new();
        if value < 253 {
            packed.push(value as u8);
        } else if value < 506 {
            packed.push(ONE_MORE_BYTE_CODE1);
            packed.push((value - 253) as u8);
        } else if value < 762 {
            packed.push(ONE_MORE_BYTE_CODE2);
            packed.push((value - 506) as u8);
        } else {
            packed.push(WORD_CODE);
            packed.push((value >> 8) as u8);
            packed.push((value & 0xff) as u8);
        }
        self.put_slice(&packed);
    }

    fn put_variable_128_u32(&mut self, value: u32) {
        let size = base128_size(value);
        for i in 0..size {
            let mut b: u8 = ((value >> (7 * (size - i - 1))) & 0x7f) as u8;
            if i < size - 1 {
                b |= 0x80;
            }
            self.put_u8(b);
        }
    }
}

impl<T: BufMut + ?Sized> BufMutVariableExt for T {}

fn base128_size(mut n: u32) -> usize {
    let mut size: usize = 1;
    while n >= 128 {
        n >>= 7;
        size += 1;
    }
    size
}
