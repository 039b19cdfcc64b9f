use std::ops::Range;

pub fn get_decay_factor(dt: f32, tau: f32) -> f32 {
    (-dt / tau).exp()
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn inv_sigmoid(y: f32) -> f32 {
    (y / (1.0 - y)).ln()
}

/// Contiguous range of batch elements handled by replica `shard_id`. The first
/// `batch_size % num_shards` replicas get one element more than the rest.
pub fn get_shard_range(num_shards: usize, shard_id: usize, batch_size: usize) -> Range<usize> {
    let min_shard_size = batch_size / num_shards;
    let remainder = batch_size % num_shards;

    let start = if shard_id < remainder {
        (min_shard_size + 1) * shard_id
    } else {
        (min_shard_size + 1) * remainder + min_shard_size * (shard_id - remainder)
    };

    let len = if shard_id < remainder {
        min_shard_size + 1
    } else {
        min_shard_size
    };

    start..start + len
}

#[cfg(test)]
pub mod test_util {
    use float_cmp::approx_eq;
    use std::fmt::Debug;

    pub fn assert_approx_eq_slice(left: &[f32], right: &[f32], epsilon: f32) {
        assert_eq!(left.len(), right.len());

        for (idx, (l, r)) in left.iter().zip(right).enumerate() {
            assert!(
                approx_eq!(f32, *l, *r, epsilon = epsilon),
                "mismatch at {}: {} vs {}",
                idx,
                l,
                r
            );
        }
    }

    pub fn assert_all<T: Debug>(values: impl IntoIterator<Item = T>, pred: impl Fn(&T) -> bool) {
        for value in values {
            assert!(pred(&value), "predicate failed for {:?}", value);
        }
    }
}
