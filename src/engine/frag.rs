//! External-fragmentation index over a free-block size-class histogram.

/// Weighted discrepancy between the actual free-block distribution and the
/// ideal in which every free byte could serve every size class.
///
/// `actual[i]` counts free blocks in class `i` (class size `min_block << i`).
/// A larger free block is conceptually splittable into smaller ones, so class
/// `i` is credited with `actual[i] + sum(actual[j] * 2^(j-i) for j > i)`; the
/// counts themselves are never modified between classes. Each credited count
/// is compared against `total_free / class_size`, optionally capped at 1 for
/// classes whose blocks do not divide the free space evenly, and the result
/// is one minus the mean ratio over all classes no larger than the free
/// space. Returns 0 when there is no free space at all.
pub(crate) fn fragmentation_index(
    actual: &[u64],
    total_free: u64,
    min_block: u64,
    cap_ratio: bool,
) -> f64 {
    if total_free == 0 {
        return 0.0;
    }

    let mut ratio_sum = 0.0;
    let mut classes = 0u32;

    for i in 0..actual.len() {
        let class_size = min_block << i;
        if class_size > total_free {
            break;
        }
        let potential = total_free / class_size;
        if potential == 0 {
            continue;
        }

        let mut credited = actual[i];
        for j in i + 1..actual.len() {
            if actual[j] > 0 {
                credited += actual[j] << (j - i);
            }
        }

        let mut ratio = credited as f64 / potential as f64;
        if cap_ratio && ratio > 1.0 {
            ratio = 1.0;
        }
        ratio_sum += ratio;
        classes += 1;
    }

    if classes == 0 {
        0.0
    } else {
        1.0 - ratio_sum / f64::from(classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_free_space_is_not_fragmented() {
        assert_eq!(fragmentation_index(&[0; 7], 0, 16, false), 0.0);
    }

    #[test]
    fn single_spanning_block_is_not_fragmented() {
        // one free block of 1024 = class 6 for a 16-byte minimum: every
        // smaller class is fully credited by splitting, every ratio is 1.
        let mut actual = [0u64; 7];
        actual[6] = 1;
        assert_eq!(fragmentation_index(&actual, 1024, 16, false), 0.0);
    }

    #[test]
    fn scattered_minimum_blocks_starve_larger_classes() {
        // 1024 free bytes shattered into 64 minimum blocks: class 0 is fully
        // served, every class above it completely starved.
        let mut actual = [0u64; 7];
        actual[0] = 64;
        let frag = fragmentation_index(&actual, 1024, 16, false);
        assert!((frag - 6.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn cap_limits_over_credited_classes() {
        // 3 blocks of 16 against 40 free bytes: potential(16) = 2, so the
        // class is over-credited and the TLSF variant clamps it.
        let actual = [3u64, 0];
        let capped = fragmentation_index(&actual, 40, 16, true);
        let uncapped = fragmentation_index(&actual, 40, 16, false);
        assert!((capped - 0.5).abs() < 1e-12);
        assert!(uncapped < capped);
    }
}
