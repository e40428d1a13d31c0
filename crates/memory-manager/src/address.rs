//! Byte-level operations on raw addresses.
//!
//! [`Address`] is a plain integer address with the handful of block
//! operations the memory managers need before any runtime exists: filling,
//! copying and comparing ranges, NUL-terminated string helpers, alignment
//! arithmetic and unchecked typed loads/stores.
//!
//! None of the memory operations check bounds. They are `unsafe` and assume
//! the caller owns every byte they touch.

use core::ptr;

/// Fills and copies shorter than this are done byte by byte.
const WORD_THRESHOLD: usize = 16;
const WORD_SIZE: usize = size_of::<u64>();

/// A raw memory address.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Debug,
    derive_more::From,
)]
#[debug("Address({_0:#x})")]
pub struct Address(usize);

impl Address {
    /// The address returned by searches that found nothing.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn as_ptr<T>(self) -> *mut T {
        ptr::with_exposed_provenance_mut(self.0)
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    #[must_use]
    pub const fn sub(self, offset: usize) -> Self {
        Self(self.0 - offset)
    }

    /// Rounds up to the next multiple of `alignment`.
    ///
    /// An alignment of zero leaves the address unchanged.
    ///
    /// ```
    /// use memory_manager::address::Address;
    ///
    /// assert_eq!(Address::new(0x1234).align_up(0x1000), Address::new(0x2000));
    /// assert_eq!(Address::new(0x1234).align_up(0), Address::new(0x1234));
    /// ```
    #[must_use]
    pub const fn align_up(self, alignment: usize) -> Self {
        if alignment == 0 {
            return self;
        }
        Self(self.0.next_multiple_of(alignment))
    }

    /// Rounds down to the previous multiple of `alignment`.
    ///
    /// An alignment of zero leaves the address unchanged.
    #[must_use]
    pub const fn align_down(self, alignment: usize) -> Self {
        if alignment == 0 {
            return self;
        }
        Self(self.0 / alignment * alignment)
    }

    #[must_use]
    pub const fn is_aligned(self, alignment: usize) -> bool {
        alignment == 0 || self.0.is_multiple_of(alignment)
    }

    /// Fills `length` bytes starting at this address with `value`.
    ///
    /// # Safety
    ///
    /// `self..self + length` must be valid for writes.
    pub unsafe fn set_range(self, value: u8, length: usize) {
        let target = self.as_ptr::<u8>();
        if length < WORD_THRESHOLD {
            for i in 0..length {
                unsafe { target.add(i).write(value) };
            }
            return;
        }

        let head = self.0.next_multiple_of(WORD_SIZE) - self.0;
        let words = (length - head) / WORD_SIZE;
        let tail = (length - head) % WORD_SIZE;
        let word = u64::from_ne_bytes([value; WORD_SIZE]);

        unsafe {
            for i in 0..head {
                target.add(i).write(value);
            }
            #[expect(clippy::cast_ptr_alignment)]
            let aligned = target.add(head).cast::<u64>();
            for i in 0..words {
                aligned.add(i).write(word);
            }
            let rest = target.add(head + words * WORD_SIZE);
            for i in 0..tail {
                rest.add(i).write(value);
            }
        }
    }

    /// Copies `length` bytes from `source` to this address.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid and must not overlap.
    pub unsafe fn copy_range(self, source: Self, length: usize) {
        let target = self.as_ptr::<u8>();
        let source = source.as_ptr::<u8>().cast_const();
        if length < WORD_THRESHOLD {
            for i in 0..length {
                unsafe { target.add(i).write(source.add(i).read()) };
            }
            return;
        }

        let head = self.0.next_multiple_of(WORD_SIZE) - self.0;
        let words = (length - head) / WORD_SIZE;
        let tail = (length - head) % WORD_SIZE;

        unsafe {
            for i in 0..head {
                target.add(i).write(source.add(i).read());
            }
            // Only the target is guaranteed to be word aligned.
            #[expect(clippy::cast_ptr_alignment)]
            let aligned_target = target.add(head).cast::<u64>();
            let word_source = source.add(head).cast::<u64>();
            for i in 0..words {
                aligned_target.add(i).write(word_source.add(i).read_unaligned());
            }
            let offset = head + words * WORD_SIZE;
            for i in 0..tail {
                target.add(offset + i).write(source.add(offset + i).read());
            }
        }
    }

    /// Copies the NUL-terminated string at `source`, terminator included.
    ///
    /// # Safety
    ///
    /// `source` must be NUL-terminated and this address must have room for
    /// the whole string including its terminator.
    pub unsafe fn copy_string(self, source: Self) {
        let target = self.as_ptr::<u8>();
        let source = source.as_ptr::<u8>().cast_const();
        let mut i = 0;
        unsafe {
            while source.add(i).read() != 0 {
                target.add(i).write(source.add(i).read());
                i += 1;
            }
            target.add(i).write(0);
        }
    }

    /// Copies at most `max_bytes` bytes of the string at `source`.
    ///
    /// The copy is always NUL-terminated and every byte after the copied
    /// characters up to `max_bytes` is zeroed. When the source is at least
    /// `max_bytes` long, the terminator lands at offset `max_bytes`.
    ///
    /// # Safety
    ///
    /// `source` must be readable up to its terminator or `max_bytes`,
    /// whichever comes first, and `self..=self + max_bytes` must be writable.
    pub unsafe fn copy_string_bounded(self, source: Self, max_bytes: usize) {
        let target = self.as_ptr::<u8>();
        let source = source.as_ptr::<u8>().cast_const();
        let mut i = 0;
        unsafe {
            while i < max_bytes && source.add(i).read() != 0 {
                target.add(i).write(source.add(i).read());
                i += 1;
            }
            target.add(i).write(0);
            while i < max_bytes {
                target.add(i).write(0);
                i += 1;
            }
        }
    }

    /// Compares `length` bytes with `other`.
    ///
    /// Returns zero when equal, otherwise the difference of the first
    /// mismatching pair (`self - other`).
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for reads.
    #[must_use]
    pub unsafe fn compare_range(self, other: Self, length: usize) -> i32 {
        let this = self.as_ptr::<u8>().cast_const();
        let other = other.as_ptr::<u8>().cast_const();
        for i in 0..length {
            let (a, b) = unsafe { (this.add(i).read(), other.add(i).read()) };
            if a != b {
                return i32::from(a) - i32::from(b);
            }
        }
        0
    }

    /// Compares two NUL-terminated strings.
    ///
    /// # Safety
    ///
    /// Both addresses must point to NUL-terminated strings.
    #[must_use]
    pub unsafe fn compare_string(self, other: Self) -> i32 {
        let this = self.as_ptr::<u8>().cast_const();
        let other = other.as_ptr::<u8>().cast_const();
        let mut i = 0;
        loop {
            let (a, b) = unsafe { (this.add(i).read(), other.add(i).read()) };
            if a == 0 || b == 0 || a != b {
                return i32::from(a) - i32::from(b);
            }
            i += 1;
        }
    }

    /// Finds the first `byte` before the terminator of the string at this
    /// address, or [`Address::NULL`].
    ///
    /// # Safety
    ///
    /// This address must point to a NUL-terminated string.
    #[must_use]
    pub unsafe fn search_character(self, byte: u8) -> Self {
        let this = self.as_ptr::<u8>().cast_const();
        let mut i = 0;
        loop {
            match unsafe { this.add(i).read() } {
                0 => return Self::NULL,
                c if c == byte => return self.add(i),
                _ => i += 1,
            }
        }
    }

    /// Number of bytes before the terminator.
    ///
    /// # Safety
    ///
    /// This address must point to a NUL-terminated string.
    #[must_use]
    pub unsafe fn string_length(self) -> usize {
        let this = self.as_ptr::<u8>().cast_const();
        let mut i = 0;
        while unsafe { this.add(i).read() } != 0 {
            i += 1;
        }
        i
    }
}

macro_rules! typed_access {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        impl Address {
            $(
                #[doc = concat!("Loads a native-endian `", stringify!($ty), "` at `offset` bytes from this address.")]
                ///
                /// # Safety
                ///
                /// The value's bytes must be valid for reads. No alignment is required.
                #[must_use]
                pub unsafe fn $read(self, offset: usize) -> $ty {
                    unsafe { self.add(offset).as_ptr::<$ty>().read_unaligned() }
                }

                #[doc = concat!("Stores a native-endian `", stringify!($ty), "` at `offset` bytes from this address.")]
                ///
                /// # Safety
                ///
                /// The value's bytes must be valid for writes. No alignment is required.
                pub unsafe fn $write(self, offset: usize, value: $ty) {
                    unsafe { self.add(offset).as_ptr::<$ty>().write_unaligned(value) }
                }
            )*
        }
    };
}

typed_access! {
    read_u8, write_u8 => u8;
    read_u16, write_u16 => u16;
    read_u32, write_u32 => u32;
    read_u64, write_u64 => u64;
}
