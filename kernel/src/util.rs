/// Round up integer division
pub const fn round_up_divide(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}

/// Round `x` up to the next multiple of `align`, which must be a power of two. Returns `None`
/// on overflow.
pub const fn checked_align_up(x: u32, align: u32) -> Option<u32> {
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

pub const fn align_down(x: u32, align: u32) -> u32 {
    x & !(align - 1)
}
