//! Partition views against the simulated chip.

mod common;

use common::{init_logs, SimChip};
use flash25::partition::validate_table;
use flash25::{BlockDevice, Error, Flash25, Partition, PartitionDescriptor, WriteMode};

const PAGE: usize = 256;

const BOOT: PartitionDescriptor = PartitionDescriptor {
    name: "boot",
    start_block: 0,
    num_blocks: 256,
};
const DATA: PartitionDescriptor = PartitionDescriptor {
    name: "data",
    start_block: 1024,
    num_blocks: 512,
};

#[test]
fn partition_addresses_parent_absolutely() {
    init_logs();
    let payload = vec![0x5A; PAGE];
    let mut sim = SimChip::sst25vf040b();
    {
        let mut dev = Flash25::new(&mut sim);
        dev.connect().unwrap();
        // Byte mode gives one address per programmed byte, which makes the
        // transcript easy to check.
        dev.set_write_mode(WriteMode::Byte);
        let mut part = Partition::open(&mut dev, &DATA).unwrap();
        part.write_blocks(0, 1, &payload).unwrap();
        assert_eq!(part.read_blocks(0, 1).unwrap(), payload);
    }
    // Partition page 0 is parent page 1024, i.e. byte address 0x040000.
    let program_frames = sim.frames_for(0x02);
    assert!(!program_frames.is_empty());
    assert_eq!(&program_frames[0][1..4], &[0x04, 0x00, 0x00]);
    // The payload really landed at the parent-absolute offset.
    assert!(sim.mem[0x040000..0x040000 + PAGE].iter().all(|b| *b == 0x5A));
}

#[test]
fn partition_bounds_are_enforced() {
    init_logs();
    let mut sim = SimChip::sst25vf040b();
    let mut dev = Flash25::new(&mut sim);
    dev.connect().unwrap();
    let mut part = Partition::open(&mut dev, &BOOT).unwrap();

    let geometry = part.geometry().unwrap();
    assert_eq!(geometry.num_pages, BOOT.num_blocks);
    assert_eq!(geometry.page_size, PAGE as u32);

    assert!(part.read_blocks(BOOT.num_blocks - 1, 1).is_ok());
    assert!(matches!(part.read_blocks(BOOT.num_blocks, 1), Err(Error::InvalidRange)));
    assert!(matches!(
        part.read_blocks(0, BOOT.num_blocks + 1),
        Err(Error::InvalidRange)
    ));
}

#[test]
fn partition_erase_delegates_with_offset() {
    init_logs();
    let mut sim = SimChip::sst25vf040b();
    {
        let mut dev = Flash25::new(&mut sim);
        dev.connect().unwrap();
        dev.write_blocks(1024, 16, &vec![0x11; 16 * PAGE]).unwrap();
        let mut part = Partition::open(&mut dev, &DATA).unwrap();
        part.erase_blocks(0, 16).unwrap();
    }
    let erase_frames = sim.frames_for(0x20);
    assert_eq!(erase_frames.len(), 1);
    assert_eq!(&erase_frames[0][1..4], &[0x04, 0x00, 0x00]);
    assert!(sim.mem[0x040000..0x041000].iter().all(|b| *b == 0xFF));
}

#[test]
fn partition_requires_active_parent() {
    init_logs();
    let mut sim = SimChip::sst25vf040b();
    let mut dev = Flash25::new(&mut sim);
    assert!(matches!(Partition::open(&mut dev, &BOOT), Err(Error::NotActive)));
}

#[test]
fn partition_must_fit_parent() {
    init_logs();
    let mut sim = SimChip::sst25vf040b();
    let mut dev = Flash25::new(&mut sim);
    dev.connect().unwrap();
    let oversized = PartitionDescriptor { name: "huge", start_block: 1024, num_blocks: 4096 };
    assert!(matches!(Partition::open(&mut dev, &oversized), Err(Error::InvalidRange)));
}

#[test]
fn full_table_validates_against_connected_geometry() {
    init_logs();
    let mut sim = SimChip::sst25vf040b();
    let mut dev = Flash25::new(&mut sim);
    dev.connect().unwrap();
    let geometry = dev.geometry().unwrap();
    validate_table(geometry, &[BOOT, DATA]).unwrap();
}
