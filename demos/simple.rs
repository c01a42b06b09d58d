use cuckootable::table::CuckooTable;

fn main() {
    let mut table = CuckooTable::<String>::with_capacity(16).expect("table allocation");

    table.insert(1, "hello".to_string());

    assert!(table.contains_key(1));

    let value = table.get(1);

    println!("Value: {:?}", value);
}
