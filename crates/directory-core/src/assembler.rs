use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::{Address, AddressRow, Phone, PhoneRow, Record, RecordHeader, RecordId};

/// Rebuilds nested records from two independently fetched child lists.
///
/// Fetching both collections through one join would repeat every parent
/// `|addresses| x |phones|` times. The assembler instead takes the two flat
/// fetches and rejoins them on the parent id:
///
/// 1. distinct parents are taken from the address rows in first-seen order;
/// 2. address rows are partitioned onto those parents;
/// 3. phone rows are indexed by parent id and attached, defaulting to empty.
///
/// The address fetch anchors the result. A parent that only appears among the
/// phone rows is not emitted, so a key-based search never returns a record that
/// has no addresses.
///
/// Rows whose owner does not line up with a known parent are dropped rather than
/// raised; referential integrity is the store's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphAssembler;

/// Row accounting for one assembly pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    /// Rows whose child owner disagrees with the parent they were fetched under.
    pub dropped_rows: usize,
    /// Phone rows of parents absent from the address fetch.
    pub unanchored_phone_rows: usize,
}

impl GraphAssembler {
    #[must_use]
    pub fn assemble(address_rows: Vec<AddressRow>, phone_rows: Vec<PhoneRow>) -> Vec<Record> {
        let (records, stats) = Self::assemble_with_stats(address_rows, phone_rows);
        if stats.dropped_rows > 0 {
            tracing::debug!(
                dropped_rows = stats.dropped_rows,
                records = records.len(),
                "graph assembly dropped rows whose owner did not match their parent"
            );
        }
        if stats.unanchored_phone_rows > 0 {
            tracing::trace!(
                unanchored_phone_rows = stats.unanchored_phone_rows,
                "phones of parents without addresses left out of the result"
            );
        }
        records
    }

    #[must_use]
    pub fn assemble_with_stats(
        address_rows: Vec<AddressRow>,
        phone_rows: Vec<PhoneRow>,
    ) -> (Vec<Record>, AssemblyStats) {
        let mut order: Vec<RecordId> = Vec::new();
        let mut shells: HashMap<RecordId, (RecordHeader, Vec<Address>)> = HashMap::new();
        let mut dropped = 0_usize;

        for AddressRow { parent, address } in address_rows {
            if address.record_id != parent.id {
                dropped += 1;
                continue;
            }
            match shells.entry(parent.id.clone()) {
                Entry::Occupied(mut shell) => shell.get_mut().1.push(address),
                Entry::Vacant(slot) => {
                    order.push(parent.id.clone());
                    slot.insert((parent, vec![address]));
                }
            }
        }

        let mut phones_by_parent: HashMap<RecordId, Vec<Phone>> = HashMap::new();
        for PhoneRow { parent_id, phone } in phone_rows {
            if phone.record_id != parent_id {
                dropped += 1;
                continue;
            }
            phones_by_parent.entry(parent_id).or_default().push(phone);
        }

        let records = order
            .into_iter()
            .filter_map(|id| {
                let (header, addresses) = shells.remove(&id)?;
                let phones = phones_by_parent.remove(&id).unwrap_or_default();
                Some(Record::from_parts(header, addresses, phones))
            })
            .collect::<Vec<_>>();

        let stats = AssemblyStats {
            dropped_rows: dropped,
            unanchored_phone_rows: phones_by_parent.values().map(Vec::len).sum(),
        };
        (records, stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::fixtures::{address, header, phone};

    fn address_row(parent: &RecordHeader, id: &str, kind: &str) -> AddressRow {
        AddressRow { parent: parent.clone(), address: address(id, parent.id.as_str(), kind) }
    }

    fn phone_row(parent: &str, id: &str, kind: &str) -> PhoneRow {
        PhoneRow { parent_id: RecordId::from(parent), phone: phone(id, parent, kind) }
    }

    #[test]
    fn single_parent_with_two_by_two_children_yields_one_record() {
        let u1 = header("u1", "Jhon", "Victor");
        let records = GraphAssembler::assemble(
            vec![address_row(&u1, "a1", "Home"), address_row(&u1, "a2", "Office")],
            vec![phone_row("u1", "p1", "Home"), phone_row("u1", "p2", "Office")],
        );

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id().as_str(), "u1");
        assert_eq!(
            record.addresses.iter().map(|a| a.kind.as_str()).collect::<Vec<_>>(),
            vec!["Home", "Office"]
        );
        assert_eq!(
            record.phones.iter().map(|p| p.kind.as_str()).collect::<Vec<_>>(),
            vec!["Home", "Office"]
        );
    }

    #[test]
    fn parents_are_emitted_in_first_seen_order_without_contamination() {
        let u1 = header("u1", "Ann", "Lee");
        let u2 = header("u2", "Ann", "Lee");
        let records = GraphAssembler::assemble(
            vec![
                address_row(&u2, "a1", "Home"),
                address_row(&u1, "a2", "Home"),
                address_row(&u2, "a3", "Office"),
            ],
            vec![phone_row("u1", "p1", "Mobile"), phone_row("u2", "p2", "Home")],
        );

        let ids = records.iter().map(|r| r.id().as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["u2", "u1"]);
        for record in &records {
            assert!(record.addresses.iter().all(|a| &a.record_id == record.id()));
            assert!(record.phones.iter().all(|p| &p.record_id == record.id()));
        }
        assert_eq!(records[0].addresses.len(), 2);
        assert_eq!(records[0].phones.len(), 1);
        assert_eq!(records[1].addresses.len(), 1);
        assert_eq!(records[1].phones[0].id.as_str(), "p1");
    }

    #[test]
    fn parent_without_phones_gets_empty_collection() {
        let u1 = header("u1", "Jhon", "Victor");
        let records = GraphAssembler::assemble(vec![address_row(&u1, "a1", "Home")], Vec::new());
        assert_eq!(records.len(), 1);
        assert!(records[0].phones.is_empty());
    }

    #[test]
    fn phone_only_parents_are_not_emitted() {
        let records = GraphAssembler::assemble(Vec::new(), vec![phone_row("u9", "p1", "Home")]);
        assert!(records.is_empty());
    }

    #[test]
    fn stats_separate_unanchored_phones_from_dropped_rows() {
        let u1 = header("u1", "Jhon", "Victor");
        let stray = PhoneRow { parent_id: RecordId::from("u1"), phone: phone("p9", "u2", "Home") };

        let (records, stats) = GraphAssembler::assemble_with_stats(
            vec![address_row(&u1, "a1", "Home")],
            vec![
                phone_row("u1", "p1", "Home"),
                phone_row("u9", "p2", "Home"),
                phone_row("u9", "p3", "Office"),
                stray,
            ],
        );

        assert_eq!(records.len(), 1);
        assert_eq!(stats, AssemblyStats { dropped_rows: 1, unanchored_phone_rows: 2 });
    }

    #[test]
    fn mismatched_owner_rows_are_dropped() {
        let u1 = header("u1", "Jhon", "Victor");
        let stray_address = AddressRow { parent: u1.clone(), address: address("a9", "u2", "Home") };
        let stray_phone =
            PhoneRow { parent_id: RecordId::from("u1"), phone: phone("p9", "u2", "Home") };

        let records = GraphAssembler::assemble(
            vec![address_row(&u1, "a1", "Home"), stray_address],
            vec![phone_row("u1", "p1", "Home"), stray_phone],
        );

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addresses.len(), 1);
        assert_eq!(records[0].phones.len(), 1);
    }

    fn interleave<T>(rows: Vec<(u64, T)>) -> Vec<T> {
        let mut rows = rows;
        rows.sort_by_key(|(key, _)| *key);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    proptest! {
        #[test]
        fn property_every_parent_appears_once_with_exact_children(
            shape in prop::collection::vec((0_usize..4, 0_usize..4), 0..8),
            seed in any::<u64>(),
        ) {
            let mut address_rows = Vec::new();
            let mut phone_rows = Vec::new();
            let mut expected: BTreeMap<String, (usize, usize)> = BTreeMap::new();

            for (parent_index, (address_count, phone_count)) in shape.iter().enumerate() {
                let parent_id = format!("u{parent_index}");
                let parent = header(&parent_id, "Same", "Name");
                for n in 0..*address_count {
                    let shift = u32::try_from(n + parent_index).unwrap_or(0);
                    let key = seed.rotate_left(shift) ^ u64::from(shift);
                    let row = address_row(&parent, &format!("{parent_id}-a{n}"), "Home");
                    address_rows.push((key, row));
                }
                for n in 0..*phone_count {
                    let shift = u32::try_from(n + parent_index).unwrap_or(0);
                    let key = seed.rotate_right(shift) ^ u64::from(shift);
                    let row = phone_row(&parent_id, &format!("{parent_id}-p{n}"), "Home");
                    phone_rows.push((key, row));
                }
                if *address_count > 0 {
                    expected.insert(parent_id, (*address_count, *phone_count));
                }
            }

            let records =
                GraphAssembler::assemble(interleave(address_rows), interleave(phone_rows));

            prop_assert_eq!(records.len(), expected.len());
            for record in &records {
                let counts = expected.get(record.id().as_str());
                prop_assert_eq!(counts, Some(&(record.addresses.len(), record.phones.len())));
                prop_assert!(record.addresses.iter().all(|a| &a.record_id == record.id()));
                prop_assert!(record.phones.iter().all(|p| &p.record_id == record.id()));
            }
        }
    }
}
