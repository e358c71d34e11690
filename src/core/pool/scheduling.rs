// src/core/pool/scheduling.rs

/// Picks the index of the smallest load. Only a strictly smaller load
/// replaces the current pick, so ties go to the lowest index. Returns `None`
/// for an empty pool.
///
/// Loads are consumed lazily, so a caller that reads each one under its
/// worker's lock holds at most one lock at a time.
pub fn least_loaded(loads: impl IntoIterator<Item = usize>) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, load) in loads.into_iter().enumerate() {
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((idx, load)),
        }
    }
    best.map(|(idx, _)| idx)
}
