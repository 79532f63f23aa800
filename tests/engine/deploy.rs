use crate::common::device::{SimState, FLASH_BASE};
use crate::device_env;
use mfdbg::engine::CapabilityFlags;
use mfdbg::wire::Command;
use mfdbg::Error;
use serial_test::serial;

const SECTOR: u32 = 256;

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
#[serial]
fn test_full_deploy() {
    let state = SimState::default().with_flash(3, SECTOR);
    device_env!(state, engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let data = image(300);
        let report = engine.deploy(&data).unwrap();

        assert!(!report.incremental);
        assert_eq!(report.sectors_erased, 3);
        assert_eq!(report.sectors_skipped, 0);
        assert_eq!(report.bytes_written, 300);

        let state = device.state();
        assert_eq!(&state.flash[..300], &data[..]);
        assert!(state.flash[300..].iter().all(|b| *b == 0xFF));
        assert_eq!(state.count(Command::CHECK_MEMORY), 0);
    });
}

#[test]
#[serial]
fn test_incremental_deploy() {
    let mut state = SimState::default().with_flash(3, SECTOR);
    state.capabilities |= CapabilityFlags::INCREMENTAL_DEPLOYMENT;
    device_env!(state, engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let data = image(600);
        let report = engine.deploy(&data).unwrap();
        assert!(report.incremental);
        assert_eq!(report.sectors_erased, 3);

        // change the middle sector only
        let mut update = data.clone();
        update[SECTOR as usize + 10] ^= 0xFF;
        device.state().erased.clear();
        let report = engine.deploy(&update).unwrap();
        assert_eq!(report.sectors_erased, 1);
        assert_eq!(report.sectors_skipped, 2);
        assert_eq!(report.bytes_written, SECTOR as usize);

        let state = device.state();
        assert_eq!(state.erased, vec![FLASH_BASE + SECTOR]);
        assert_eq!(&state.flash[..600], &update[..]);
    });
}

#[test]
#[serial]
fn test_deploy_storage_errors() {
    device_env!(SimState::default(), engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        assert!(matches!(
            engine.deploy(&image(10)),
            Err(Error::NoDeploymentStorage)
        ));
        assert_eq!(device.state().count(Command::FLASH_SECTOR_MAP), 1);
    });

    let state = SimState::default().with_flash(1, SECTOR);
    device_env!(state, engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        assert!(matches!(
            engine.deploy(&image(SECTOR as usize + 1)),
            Err(Error::InsufficientStorage {
                required: 257,
                available: 256
            })
        ));
        assert!(device.state().erased.is_empty());
    });
}
