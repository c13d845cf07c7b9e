//! Property tests: buffer-list laws against a flat reference model, part
//! planning coverage, and key-mapping round trips.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tidefs_backend::keys;
    use tidefs_fs::buffer::{BufferList, ReadSegment};
    use tidefs_fs::multipart::plan_parts;

    /// Applies a write to the flat reference model, zero-extending gaps the
    /// way the filesystem materialises holes.
    fn model_write(model: &mut Vec<u8>, offset: usize, data: &[u8]) {
        if offset > model.len() {
            model.resize(offset, 0);
        }
        let end = offset + data.len();
        if end > model.len() {
            model.resize(end, 0);
        }
        model[offset..end].copy_from_slice(data);
    }

    fn list_write(list: &mut BufferList, size: &mut u64, offset: u64, data: &[u8], max: u64) {
        if offset > *size {
            list.zero_fill(*size, offset);
        }
        list.write(offset, data, max);
        *size = (*size).max(offset + data.len() as u64);
    }

    fn read_all(list: &BufferList, size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for seg in list.read(0, size, size).unwrap() {
            match seg {
                ReadSegment::Data { bytes, .. } => out.extend_from_slice(&bytes),
                ReadSegment::Zero { len, .. } => out.extend(vec![0u8; len as usize]),
                ReadSegment::Missing { .. } => panic!("write-only list has no missing ranges"),
            }
        }
        out
    }

    proptest! {
        #[test]
        fn writes_match_flat_model(
            ops in proptest::collection::vec(
                (0u64..512, proptest::collection::vec(any::<u8>(), 1..64)),
                1..24,
            ),
            max_buffer in 8u64..128,
        ) {
            let mut list = BufferList::new();
            let mut size = 0u64;
            let mut model: Vec<u8> = Vec::new();

            for (offset, data) in &ops {
                list_write(&mut list, &mut size, *offset, data, max_buffer);
                model_write(&mut model, *offset as usize, data);

                prop_assert!(list.check_invariants(size).is_ok());
                prop_assert_eq!(size as usize, model.len());
            }

            prop_assert_eq!(read_all(&list, size), model);
        }

        #[test]
        fn flush_fence_preserves_model(
            ops in proptest::collection::vec(
                (0u64..256, proptest::collection::vec(any::<u8>(), 1..32)),
                2..12,
            ),
        ) {
            let mut list = BufferList::new();
            let mut size = 0u64;
            let mut model: Vec<u8> = Vec::new();

            // first half of the ops, then a flush cycle, then the rest
            let split = ops.len() / 2;
            for (offset, data) in &ops[..split] {
                list_write(&mut list, &mut size, *offset, data, 64);
                model_write(&mut model, *offset as usize, data);
            }
            let fence = list.begin_flush();
            for (offset, data) in &ops[split..] {
                list_write(&mut list, &mut size, *offset, data, 64);
                model_write(&mut model, *offset as usize, data);
            }
            list.end_flush(fence, true);

            prop_assert!(list.check_invariants(size).is_ok());
            prop_assert_eq!(read_all(&list, size), model);
        }

        #[test]
        fn part_plan_covers_body_exactly(
            total in 0u64..100_000,
            part in 1u64..9_000,
        ) {
            let parts = plan_parts(total, part, 8, 16_384);
            let mut cursor = 0u64;
            for (i, range) in parts.iter().enumerate() {
                prop_assert_eq!(range.offset, cursor);
                prop_assert!(range.len > 0);
                prop_assert!(range.len <= 16_384);
                // every part except the last respects the minimum
                if i + 1 < parts.len() {
                    prop_assert!(range.len >= 8);
                }
                cursor += range.len;
            }
            prop_assert_eq!(cursor, total);
        }

        #[test]
        fn key_join_and_split_round_trip(
            components in proptest::collection::vec("[a-z0-9._-]{1,12}", 1..6),
        ) {
            let mut key = String::new();
            for component in &components {
                key = keys::join_key(&key, component);
            }
            prop_assert_eq!(keys::key_name(&key), components.last().unwrap().as_str());

            let parent = keys::parent_key(&key);
            if components.len() == 1 {
                prop_assert_eq!(parent, "");
            } else {
                prop_assert!(key.starts_with(parent));
                prop_assert!(keys::is_under(parent, &key));
            }
        }

        #[test]
        fn rebase_preserves_suffix(
            src in "[a-z]{1,8}",
            dst in "[a-z]{1,8}",
            suffix in proptest::collection::vec("[a-z0-9]{1,8}", 1..4),
        ) {
            let mut key = src.clone();
            for component in &suffix {
                key = keys::join_key(&key, component);
            }
            let rebased = keys::rebase_key(&key, &src, &dst).unwrap();
            prop_assert!(rebased.starts_with(&dst));
            prop_assert!(rebased.ends_with(suffix.last().unwrap().as_str()));
            // rebasing back restores the original
            prop_assert_eq!(keys::rebase_key(&rebased, &dst, &src).unwrap(), key);
        }
    }
}
