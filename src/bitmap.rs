use core::{mem, ptr::NonNull};

/// A view over a bitmap of `num_bits` bits stored in consecutive `u32` words.
///
/// A set bit marks an allocated object; a clear bit marks a free one.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u32>,
}

impl Bitmap {
    /// Returns the number of bytes needed to store `num_bits` bits.
    #[inline]
    pub const fn map_size(num_bits: usize) -> usize {
        Self::num_words(num_bits) * mem::size_of::<u32>()
    }

    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(u32::BITS as usize)
    }

    /// Constructs a bitmap of `num_bits` bits over `map` and clears it.
    ///
    /// # Safety
    ///
    /// `map` must be properly aligned and valid for reads and writes for
    /// [`Bitmap::map_size(num_bits)`] bytes for as long as the bitmap is used.
    ///
    /// [`Bitmap::map_size(num_bits)`]: Bitmap::map_size
    pub unsafe fn init(num_bits: usize, map: NonNull<u32>) -> Bitmap {
        let bitmap = unsafe { Bitmap::from_raw(num_bits, map) };

        for i in 0..Self::num_words(num_bits) {
            unsafe { map.add(i).write(0) };
        }

        bitmap
    }

    /// Constructs a view over an already initialized bitmap.
    ///
    /// # Safety
    ///
    /// Same as [`Bitmap::init`], and the words must have been initialized.
    pub unsafe fn from_raw(num_bits: usize, map: NonNull<u32>) -> Bitmap {
        assert!(num_bits > 0);
        assert!(map.as_ptr().align_offset(mem::align_of::<u32>()) == 0);

        Bitmap { num_bits, map }
    }

    /// Returns a tuple of the index of the `u32` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u32) {
        (bit / u32::BITS as usize, 1 << (bit % u32::BITS as usize))
    }

    #[inline]
    fn word(&self, idx: usize) -> u32 {
        unsafe { self.map.add(idx).read() }
    }

    #[inline]
    fn set_word(&mut self, idx: usize, value: u32) {
        unsafe { self.map.add(idx).write(value) }
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);
        self.word(word) & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);
        let old = self.word(word);
        self.set_word(
            word,
            match value {
                true => old | mask,
                false => old & !mask,
            },
        );
    }

    /// Returns the index of the first clear bit, if any.
    pub fn first_clear(&self) -> Option<usize> {
        (0..Self::num_words(self.num_bits)).find_map(|w| {
            let word = self.word(w);
            (word != u32::MAX)
                .then(|| w * u32::BITS as usize + word.trailing_ones() as usize)
                .filter(|&bit| bit < self.num_bits)
        })
    }

    /// Returns an iterator over the indices of the set bits.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_bits).filter(move |&bit| self.get(bit))
    }

    /// Returns the number of set bits.
    pub fn count_set(&self) -> usize {
        (0..Self::num_words(self.num_bits))
            .map(|w| self.word(w).count_ones() as usize)
            .sum()
    }
}
