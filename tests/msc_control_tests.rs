#![allow(unused_variables)]

mod helpers;
use helpers::*;

use usbd_class_tester::prelude::*;

use usb_device::bus::UsbBusAllocator;
use usbd_msc_dfu::msc::*;

pub struct TwoLuns {
    capacity_calls: usize,
}

impl BlockDevice for TwoLuns {
    const LUN_COUNT: u8 = 2;

    fn capacity(&mut self, lun: u8) -> Result<BlockCapacity, StorageError> {
        self.capacity_calls += 1;
        Ok(BlockCapacity {
            block_count: 16,
            block_size: 512,
        })
    }

    fn read_blocks(&mut self, lun: u8, lba: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        buf.fill(0);
        Ok(())
    }

    fn write_blocks(&mut self, lun: u8, lba: u32, data: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Default MSC class factory
struct MkMSC {}

impl UsbDeviceCtx for MkMSC {
    type C<'c> = MscClass<'c, EmulatedUsbBus, TwoLuns>;
    const EP0_SIZE: u8 = 32;

    fn create_class<'a>(
        &mut self,
        alloc: &'a UsbBusAllocator<EmulatedUsbBus>,
    ) -> AnyResult<MscClass<'a, EmulatedUsbBus, TwoLuns>> {
        Ok(MscClass::new(alloc, 64, TwoLuns { capacity_calls: 0 }))
    }
}

#[test]
fn test_get_configuration() {
    MkMSC {}
        .with_usb(|mut msc, mut dev| {
            let vec = dev.get_configuration(&mut msc).expect("vec");
            assert_eq!(vec.len(), 9 + 9 + 7 + 7);

            // interface descriptor
            assert_eq!(
                &vec[9..18],
                &[
                    9, 4, 0, 0, 2, 0x08, // mass storage
                    0x06, // scsi transparent
                    0x50, // bulk-only
                    0
                ]
            );

            // bulk IN endpoint
            let ep_in = &vec[18..25];
            assert_eq!(&ep_in[..2], &[7, 5]);
            assert_ne!(ep_in[2] & 0x80, 0);
            assert_eq!(&ep_in[3..6], &[0x02, 64, 0]);

            // bulk OUT endpoint
            let ep_out = &vec[25..32];
            assert_eq!(&ep_out[..2], &[7, 5]);
            assert_eq!(ep_out[2] & 0x80, 0);
            assert_eq!(&ep_out[3..6], &[0x02, 64, 0]);
        })
        .expect("with_usb");
}

#[test]
fn test_get_max_lun() {
    MkMSC {}
        .with_usb(|mut msc, mut dev| {
            let vec = dev.get_max_lun(&mut msc).expect("vec");
            assert_eq!(&vec[..], &[1]);
        })
        .expect("with_usb");
}

#[test]
fn test_bulk_only_reset() {
    MkMSC {}
        .with_usb(|mut msc, mut dev| {
            let calls = msc.storage().capacity_calls;

            let vec = dev.bulk_only_reset(&mut msc).expect("vec");
            assert_eq!(&vec[..], &[]);

            assert_eq!(msc.stage(), Stage::ReadCbw);
            // capacity of both units is queried again
            assert_eq!(msc.storage().capacity_calls, calls + 2);
        })
        .expect("with_usb");
}

#[test]
fn test_unknown_request() {
    MkMSC {}
        .with_usb(|mut msc, mut dev| {
            dev.read(&mut msc, 0xfc, 0, 0, 1).expect_err("stall");
            dev.write(&mut msc, 0xfd, 0, 0, 0, &[]).expect_err("stall");

            // Reset with a data stage is not valid
            dev.write(&mut msc, MSC_BULK_ONLY_RESET, 0, 0, 1, &[0])
                .expect_err("stall");
        })
        .expect("with_usb");
}

#[test]
fn test_clear_in_halt() {
    MkMSC {}
        .with_usb(|mut msc, mut dev| {
            let vec = dev.get_configuration(&mut msc).expect("vec");
            let ep_in = vec[18 + 2];

            // seen by the class, accepted by usb-device
            dev.endpoint_clear_feature(&mut msc, ep_in, 0)
                .expect("clear halt");
            assert_eq!(msc.stage(), Stage::ReadCbw);
        })
        .expect("with_usb");
}
