use crate::SelectError;
use rand::{seq::index, Rng};

/// Keep a uniform random subset of at most `max` items, in their original
/// relative order.
pub fn random_culling<T, R>(items: Vec<T>, max: usize, rng: &mut R) -> Vec<T>
where
    R: Rng + ?Sized,
{
    if items.len() <= max {
        return items;
    }
    let mut keep = vec![false; items.len()];
    for i in index::sample(rng, items.len(), max) {
        keep[i] = true;
    }
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then_some(item))
        .collect()
}

/// [`random_culling`] over two parallel vectors, keeping the same positions
/// in both.
pub fn random_culling_paired<A, B, R>(
    left: Vec<A>,
    right: Vec<B>,
    max: usize,
    rng: &mut R,
) -> Result<(Vec<A>, Vec<B>), SelectError>
where
    R: Rng + ?Sized,
{
    if left.len() != right.len() {
        return Err(SelectError::LengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    let culled = random_culling(left.into_iter().zip(right).collect(), max, rng);
    Ok(culled.into_iter().unzip())
}
