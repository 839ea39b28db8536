use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitvec::prelude::*;

/// Symmetric banded contact matrix.
///
/// Logically the matrix is `ncols x ncols` and symmetric; physically only the
/// band `|row - col| < nrows` is stored, column-major, as
/// `counts[j * nrows + i]` with `i = |row - col|` and `j = max(row, col)`.
/// Cells outside the band read as zero; writes outside the band are counted
/// in `missed_updates` instead of being stored.
///
/// Writes to distinct columns proceed in parallel; writes to the same column
/// serialize on that column's mutex. `get` never takes a lock, so readers may
/// observe a concurrent update mid-batch; the running totals use relaxed
/// atomics and converge at quiescence.
pub struct ContactMatrix {
    nrows: usize,
    ncols: usize,
    counts: Vec<AtomicU32>,
    locks: Vec<Mutex<()>>,
    tot_contacts: AtomicU64,
    missed_updates: AtomicU64,
}

/// Fold logical coordinates into band space: `(|r - c|, max(r, c))`.
#[inline]
pub(crate) fn transpose_coords(row: usize, col: usize) -> (usize, usize) {
    if row > col {
        (row - col, row)
    } else {
        (col - row, col)
    }
}

impl ContactMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        let nrows = nrows.min(ncols);
        Self {
            nrows,
            ncols,
            counts: (0..nrows * ncols).map(|_| AtomicU32::new(0)).collect(),
            locks: (0..ncols).map(|_| Mutex::new(())).collect(),
            tot_contacts: AtomicU64::new(0),
            missed_updates: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored (band) pixels.
    #[inline]
    pub fn npixels(&self) -> usize {
        self.nrows * self.ncols
    }

    #[inline]
    pub fn tot_contacts(&self) -> u64 {
        self.tot_contacts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn missed_updates(&self) -> u64 {
        self.missed_updates.load(Ordering::Relaxed)
    }

    pub fn empty(&self) -> bool {
        self.tot_contacts() == 0
    }

    #[inline]
    fn cell(&self, i: usize, j: usize) -> &AtomicU32 {
        debug_assert!(i < self.nrows && j < self.ncols);
        &self.counts[j * self.nrows + i]
    }

    /// Read one logical cell. Symmetric: `get(r, c) == get(c, r)`.
    pub fn get(&self, row: usize, col: usize) -> u32 {
        let (i, j) = transpose_coords(row, col);
        debug_assert!(
            j < self.ncols,
            "get({}, {}) is outside the {}x{} matrix",
            row,
            col,
            self.ncols,
            self.ncols
        );
        if j >= self.ncols || i >= self.nrows {
            return 0;
        }
        self.cell(i, j).load(Ordering::Relaxed)
    }

    /// Returns false when the write landed outside the band and was recorded
    /// as a missed update instead.
    #[inline]
    fn band_check(&self, i: usize, j: usize) -> bool {
        debug_assert!(j < self.ncols, "column {} out of range 0..{}", j, self.ncols);
        if j >= self.ncols || i >= self.nrows {
            self.missed_updates.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Overwrite one cell, adjusting the running total by the delta.
    pub fn set(&self, row: usize, col: usize, n: u32) {
        let (i, j) = transpose_coords(row, col);
        if !self.band_check(i, j) {
            return;
        }
        let _guard = self.locks[j].lock().unwrap();
        let old = self.cell(i, j).load(Ordering::Relaxed);
        self.cell(i, j).store(n, Ordering::Relaxed);
        if n >= old {
            self.tot_contacts
                .fetch_add(u64::from(n - old), Ordering::Relaxed);
        } else {
            self.tot_contacts
                .fetch_sub(u64::from(old - n), Ordering::Relaxed);
        }
    }

    pub fn add(&self, row: usize, col: usize, n: u32) {
        let (i, j) = transpose_coords(row, col);
        if !self.band_check(i, j) {
            return;
        }
        let _guard = self.locks[j].lock().unwrap();
        let old = self.cell(i, j).load(Ordering::Relaxed);
        debug_assert!(
            old.checked_add(n).is_some(),
            "adding {} to cell ({}, {}) holding {} overflows",
            n,
            row,
            col,
            old
        );
        self.cell(i, j).store(old.wrapping_add(n), Ordering::Relaxed);
        self.tot_contacts.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn subtract(&self, row: usize, col: usize, n: u32) {
        let (i, j) = transpose_coords(row, col);
        if !self.band_check(i, j) {
            return;
        }
        let _guard = self.locks[j].lock().unwrap();
        let old = self.cell(i, j).load(Ordering::Relaxed);
        debug_assert!(
            old >= n,
            "subtracting {} from cell ({}, {}) holding {} underflows",
            n,
            row,
            col,
            old
        );
        self.cell(i, j)
            .store(old.saturating_sub(n), Ordering::Relaxed);
        self.tot_contacts
            .fetch_sub(u64::from(old.min(n)), Ordering::Relaxed);
    }

    #[inline]
    pub fn increment(&self, row: usize, col: usize) {
        self.add(row, col, 1);
    }

    #[inline]
    pub fn decrement(&self, row: usize, col: usize) {
        self.subtract(row, col, 1);
    }

    /// Batched add. Pixels are folded into band space and sorted by column in
    /// place. Small batches take one lock acquisition per pixel; larger ones
    /// group consecutive same-column runs under a single acquisition.
    pub fn add_pixels(&self, pixels: &mut [(usize, usize)], n: u32, size_threshold: usize) {
        for p in pixels.iter_mut() {
            *p = transpose_coords(p.0, p.1);
        }
        pixels.sort_unstable_by_key(|&(_, j)| j);

        if pixels.len() < size_threshold {
            for &(i, j) in pixels.iter() {
                if !self.band_check(i, j) {
                    continue;
                }
                let _guard = self.locks[j].lock().unwrap();
                let old = self.cell(i, j).load(Ordering::Relaxed);
                self.cell(i, j).store(old.wrapping_add(n), Ordering::Relaxed);
                self.tot_contacts.fetch_add(u64::from(n), Ordering::Relaxed);
            }
            return;
        }

        let mut added = 0u64;
        let mut missed = 0u64;
        let mut start = 0;
        while start < pixels.len() {
            let col = pixels[start].1;
            let end = start + pixels[start..].partition_point(|&(_, j)| j == col);
            debug_assert!(col < self.ncols, "column {} out of range 0..{}", col, self.ncols);
            if col >= self.ncols {
                missed += (end - start) as u64;
                start = end;
                continue;
            }
            let _guard = self.locks[col].lock().unwrap();
            for &(i, j) in &pixels[start..end] {
                if i >= self.nrows {
                    missed += 1;
                    continue;
                }
                let old = self.cell(i, j).load(Ordering::Relaxed);
                self.cell(i, j).store(old.wrapping_add(n), Ordering::Relaxed);
                added += u64::from(n);
            }
            start = end;
        }
        self.tot_contacts.fetch_add(added, Ordering::Relaxed);
        self.missed_updates.fetch_add(missed, Ordering::Relaxed);
    }

    /// Bit `i` is set iff bin `i` has at least one non-zero contact within
    /// the band, looking along both its row and its column.
    pub fn mask_of_nonempty_bins(&self) -> BitVec {
        let mut mask = bitvec![0; self.ncols];
        for i in 0..self.ncols {
            let hi = (i + self.nrows).min(self.ncols);
            let mut nonempty = (i..hi).any(|j| self.get(i, j) != 0);
            if !nonempty {
                let lo = i.saturating_sub(self.nrows - 1);
                nonempty = (lo..i).any(|j| self.get(i, j) != 0);
            }
            mask.set(i, nonempty);
        }
        mask
    }

    /// Total contacts per diagonal distance; index `d` sums all cells with
    /// `|row - col| == d`.
    pub fn row_wise_contact_histogram(&self) -> Vec<u64> {
        let mut hist = vec![0u64; self.nrows];
        for i in 0..self.ncols {
            for j in i..(i + self.nrows).min(self.ncols) {
                hist[j - i] += u64::from(self.get(j, i));
            }
        }
        hist
    }

    /// Subtract from every band cell the mean count of its diagonal (scaled
    /// by `multiplier`), clamping at zero. The mean only counts bins that
    /// have contacts somewhere in their row/column.
    pub fn deplete_contacts(&self, multiplier: f64) {
        let effective_nbins = self.mask_of_nonempty_bins().count_ones();
        if effective_nbins == 0 {
            return;
        }
        let hist = self.row_wise_contact_histogram();
        let avg: Vec<u32> = hist
            .iter()
            .map(|&n| ((multiplier * n as f64) / effective_nbins as f64).round() as u32)
            .collect();

        for i in 0..self.ncols {
            for j in i..(i + self.nrows).min(self.ncols) {
                let d = j - i;
                if self.get(j, i) > avg[d] {
                    self.subtract(j, i, avg[d]);
                } else {
                    self.set(j, i, 0);
                }
            }
        }
    }

    /// Band pixels remaining after discarding rows/columns of bins with no
    /// contacts at all.
    pub fn npixels_after_masking(&self) -> usize {
        let mut npixels = self.npixels();
        let mask = self.mask_of_nonempty_bins();
        if mask.all() {
            return npixels;
        }
        if mask.not_any() {
            return 0;
        }

        let count_zeros =
            |lo: usize, hi: usize| -> usize { (lo..hi).filter(|&k| !mask[k]).count() };

        for i in 0..self.ncols {
            if mask[i] {
                continue;
            }
            if i < self.nrows {
                // Upper-left corner: the column above bin i is truncated.
                npixels -= self.nrows - count_zeros(0, i);
                npixels -= i;
            } else if i > self.ncols - self.nrows {
                // Lower-right corner: the row right of bin i is truncated.
                npixels -= self.nrows - count_zeros(i - self.nrows, i);
                npixels -= self.ncols - i;
            } else {
                npixels -= 2 * self.nrows - 1 - count_zeros(i - self.nrows, i);
            }
        }
        npixels
    }

    /// Iterate non-zero band cells as `(bin1, bin2, count)` with
    /// `bin1 <= bin2`.
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (usize, usize, u32)> + '_ {
        (0..self.ncols).flat_map(move |j| {
            (0..self.nrows.min(j + 1)).filter_map(move |i| {
                let n = self.cell(i, j).load(Ordering::Relaxed);
                (n != 0).then_some((j - i, j, n))
            })
        })
    }

    /// Snapshot of the band-major storage (`counts[j * nrows + i]`).
    pub fn raw_counts(&self) -> Vec<u32> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Zero the storage and both counters.
    pub fn reset(&mut self) {
        for c in &mut self.counts {
            *c.get_mut() = 0;
        }
        *self.tot_contacts.get_mut() = 0;
        *self.missed_updates.get_mut() = 0;
    }

    /// Reallocate to a new shape, rebuilding the lock array. Contents are
    /// discarded.
    pub fn resize(&mut self, nrows: usize, ncols: usize) {
        *self = Self::new(nrows, ncols);
    }
}

impl std::fmt::Debug for ContactMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactMatrix")
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .field("tot_contacts", &self.tot_contacts())
            .field("missed_updates", &self.missed_updates())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_increments() {
        let m = ContactMatrix::new(10, 100);
        assert_eq!(m.get(0, 0), 0);
        m.increment(0, 0);
        assert_eq!(m.get(0, 0), 1);
        m.increment(0, 0);
        assert_eq!(m.get(0, 0), 2);
        assert_eq!(m.tot_contacts(), 2);
        m.subtract(0, 0, 2);
        assert_eq!(m.get(0, 0), 0);
        assert_eq!(m.tot_contacts(), 0);
    }

    #[test]
    fn test_symmetry() {
        let m = ContactMatrix::new(10, 50);
        m.add(3, 9, 7);
        assert_eq!(m.get(3, 9), 7);
        assert_eq!(m.get(9, 3), 7);
        m.increment(9, 3);
        assert_eq!(m.get(3, 9), 8);
    }

    #[test]
    fn test_out_of_band_write_is_missed() {
        let m = ContactMatrix::new(10, 20);
        m.increment(11, 0);
        assert_eq!(m.get(11, 0), 0);
        assert_eq!(m.get(0, 0), 0);
        assert_eq!(m.missed_updates(), 1);
        assert_eq!(m.tot_contacts(), 0);
    }

    #[test]
    fn test_out_of_band_read_is_zero() {
        let m = ContactMatrix::new(5, 20);
        for r in 0..20usize {
            for c in 0..20usize {
                if r.abs_diff(c) >= 5 {
                    assert_eq!(m.get(r, c), 0);
                }
            }
        }
    }

    #[test]
    fn test_set_adjusts_total_by_delta() {
        let m = ContactMatrix::new(10, 20);
        m.set(1, 2, 10);
        assert_eq!(m.tot_contacts(), 10);
        m.set(1, 2, 4);
        assert_eq!(m.tot_contacts(), 4);
        m.set(1, 2, 0);
        assert_eq!(m.tot_contacts(), 0);
    }

    #[test]
    fn test_total_equals_sum_of_cells() {
        let m = ContactMatrix::new(10, 30);
        for i in 0..30 {
            for j in i..(i + 10).min(30) {
                m.add(i, j, ((i + j) % 5) as u32);
            }
        }
        let sum: u64 = m.iter_nonzero().map(|(_, _, n)| u64::from(n)).sum();
        assert_eq!(sum, m.tot_contacts());
    }

    #[test]
    fn test_mask_all_zero_matrix() {
        let m = ContactMatrix::new(10, 20);
        let mask = m.mask_of_nonempty_bins();
        assert_eq!(mask.len(), 20);
        assert!(mask.not_any());
    }

    #[test]
    fn test_mask_single_set_cell() {
        let m = ContactMatrix::new(10, 20);
        m.set(4, 7, 3);
        let mask = m.mask_of_nonempty_bins();
        for i in 0..20 {
            assert_eq!(mask[i], i == 4 || i == 7, "bin {}", i);
        }
    }

    #[test]
    fn test_mask_checkerboard() {
        let m = ContactMatrix::new(10, 20);
        for i in 0..20 {
            for j in i..20 {
                if i % 2 == 1 && j % 2 == 1 {
                    m.set(i, j, 1);
                }
            }
        }
        let mask = m.mask_of_nonempty_bins();
        assert_eq!(mask.len(), 20);
        for i in 0..20 {
            assert_eq!(mask[i], i % 2 == 1, "bin {}", i);
        }
    }

    #[test]
    fn test_reset() {
        let mut m = ContactMatrix::new(10, 20);
        m.add(0, 5, 9);
        m.increment(11, 0);
        m.reset();
        assert_eq!(m.get(0, 5), 0);
        assert_eq!(m.tot_contacts(), 0);
        assert_eq!(m.missed_updates(), 0);
    }

    #[test]
    fn test_histogram_by_diagonal() {
        let m = ContactMatrix::new(4, 10);
        // Two contacts at distance 0, three at distance 2.
        m.add(1, 1, 2);
        m.add(3, 5, 3);
        let hist = m.row_wise_contact_histogram();
        assert_eq!(hist, vec![2, 0, 3, 0]);
    }

    #[test]
    fn test_deplete_uniform_diagonal() {
        // Constant count along one diagonal distance; depleting with
        // multiplier 1 zeroes that diagonal.
        let m = ContactMatrix::new(5, 20);
        for i in 0..18 {
            m.set(i, i + 2, 4);
        }
        let nonempty = m.mask_of_nonempty_bins().count_ones();
        assert_eq!(nonempty, 20);
        m.deplete_contacts(1.0);
        for i in 0..18 {
            assert_eq!(m.get(i, i + 2), 0, "cell ({}, {})", i, i + 2);
        }
        assert_eq!(m.tot_contacts(), 0);
    }

    #[test]
    fn test_add_pixels_small_and_large_agree() {
        let pixels: Vec<(usize, usize)> = (0..40).map(|k| (k % 10, (k * 3) % 20)).collect();

        let small = ContactMatrix::new(10, 20);
        small.add_pixels(&mut pixels.clone(), 2, usize::MAX);
        let large = ContactMatrix::new(10, 20);
        large.add_pixels(&mut pixels.clone(), 2, 0);

        assert_eq!(small.tot_contacts(), large.tot_contacts());
        assert_eq!(small.missed_updates(), large.missed_updates());
        for r in 0..20 {
            for c in 0..20 {
                assert_eq!(small.get(r, c), large.get(r, c), "cell ({}, {})", r, c);
            }
        }
    }

    #[test]
    fn test_add_pixels_counts_out_of_band() {
        let m = ContactMatrix::new(5, 20);
        let mut pixels = vec![(0, 10), (0, 19), (12, 14)];
        m.add_pixels(&mut pixels, 1, 0);
        // (0, 10) and (0, 19) are at distances 10 and 19: out of band.
        assert_eq!(m.missed_updates(), 2);
        assert_eq!(m.tot_contacts(), 1);
        assert_eq!(m.get(0, 10), 0);
        assert_eq!(m.get(12, 14), 1);
    }

    #[test]
    fn test_raw_counts_layout_is_band_major() {
        let m = ContactMatrix::new(4, 10);
        m.set(2, 5, 9); // i = 3, j = 5
        let raw = m.raw_counts();
        assert_eq!(raw.len(), 40);
        assert_eq!(raw[5 * 4 + 3], 9);
        assert_eq!(raw.iter().map(|&n| u64::from(n)).sum::<u64>(), 9);
    }

    #[test]
    fn test_npixels_after_masking() {
        let m = ContactMatrix::new(10, 20);
        assert_eq!(m.npixels_after_masking(), 0);
        for i in 0..20 {
            m.set(i, i, 1);
        }
        assert_eq!(m.npixels_after_masking(), m.npixels());
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;
        let m = Arc::new(ContactMatrix::new(10, 100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for k in 0..10_000 {
                        m.increment(k % 100, k % 100);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.tot_contacts(), 40_000);
        let sum: u64 = m.iter_nonzero().map(|(_, _, n)| u64::from(n)).sum();
        assert_eq!(sum, 40_000);
    }
}
