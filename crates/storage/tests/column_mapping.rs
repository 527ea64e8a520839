use std::collections::BTreeSet;

use fluxd_storage::Column;

#[test]
fn column_index_and_bit_are_stable() {
    let mut seen = 0u32;
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        assert_eq!(column.bit(), 1u32 << idx);
        assert_eq!(seen & column.bit(), 0, "duplicate bit for {column:?}");
        seen |= column.bit();
    }
    assert_eq!(seen.count_ones() as usize, Column::ALL.len());
}

#[test]
fn column_names_are_distinct() {
    let names: BTreeSet<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
    assert_eq!(Column::Meta.as_str(), "meta");
}
