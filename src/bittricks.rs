// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
bit tricks for staging buffer sizing.

Staging buffers are arrays of 32-bit words, one word per RGBA8 pixel, so most of this
is about rounding.
*/

/// Bytes per staging buffer element.
pub const ELEMENT_BYTES: usize = 4;

/// Capacity (in elements) a staging buffer must be allocated with to hold `required` elements.
///
/// This is the next power of two at or above `required`, floored by `initial`.
/// Returns `None` when the power of two does not fit in a `usize`.
pub fn staging_capacity_for(required: usize, initial: usize) -> Option<usize> {
    //checked_next_power_of_two maps 0 to 1
    let rounded = required.checked_next_power_of_two()?;
    Some(rounded.max(initial))
}

/// Rounds `bytes` up to a whole number of staging elements.
pub const fn align_to_element(bytes: usize) -> usize {
    (bytes + ELEMENT_BYTES - 1) & !(ELEMENT_BYTES - 1)
}
