//! Memory-mapped external SPI flash (1 MiB at 0x90000000), read-only, with
//! optional on-the-fly decryption when an encrypted dump is loaded.

use crate::otfdec::{GcmRegion, OtfDec};

pub const BASE: u32 = 0x9000_0000;
pub const SIZE: usize = 1024 * 1024;

/// OTFDEC (AES-CTR) parameters from the key descriptor.
#[derive(Debug, Clone, Copy)]
pub struct OtfConfig {
    pub key: [u32; 4],
    pub nonce: [u32; 2],
    pub version: u16,
    pub region: u8,
    pub start: u32,
    pub end: u32,
}

/// AES-GCM trailer-region parameters from the key descriptor.
#[derive(Debug, Clone, Copy)]
pub struct GcmConfig {
    pub key: [u32; 4],
    pub iv: [u32; 3],
    pub base: u32,
    pub region_len: u32,
    pub data_len: u32,
}

pub struct ExternalFlash {
    data: Vec<u8>,
    decrypted: bool,
    otf: Option<OtfDec>,
    gcm: Option<GcmRegion>,
}

impl Default for ExternalFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalFlash {
    pub fn new() -> ExternalFlash {
        ExternalFlash {
            data: vec![0xFF; SIZE],
            decrypted: true,
            otf: None,
            gcm: None,
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= BASE && (addr - BASE) < SIZE as u32
    }

    /// Install a dump. `decrypted` dumps bypass both decryptors.
    pub fn load(&mut self, data: &[u8], decrypted: bool) -> usize {
        let len = data.len().min(SIZE);
        self.data[..len].copy_from_slice(&data[..len]);
        self.decrypted = decrypted;
        len
    }

    pub fn is_decrypted(&self) -> bool {
        self.decrypted
    }

    pub fn configure_otf(&mut self, config: &OtfConfig) {
        self.otf = Some(OtfDec::new(
            &config.key,
            &config.nonce,
            config.version,
            config.region,
            config.start,
            config.end,
        ));
    }

    pub fn configure_gcm(&mut self, config: &GcmConfig) {
        self.gcm = Some(GcmRegion::new(
            &config.key,
            &config.iv,
            config.base,
            config.region_len,
            config.data_len,
        ));
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        let off = (addr - BASE) as usize;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.data.get(off + i).copied().unwrap_or(0xFF);
        }
        if self.decrypted {
            return;
        }
        if let Some(otf) = self.otf.as_ref().filter(|o| o.contains(addr)) {
            otf.decrypt(addr, buf);
        } else if let Some(gcm) = self.gcm.as_ref().filter(|g| g.in_data(addr)) {
            gcm.decrypt(addr, buf);
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf);
        buf[0]
    }

    pub fn read16(&self, addr: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    pub fn read32(&self, addr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf);
        u32::from_le_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otf_config() -> OtfConfig {
        OtfConfig {
            key: [1, 2, 3, 4],
            nonce: [5, 6],
            version: 1,
            region: 3,
            start: BASE,
            end: 0x900F_DFFF,
        }
    }

    #[test]
    fn decrypted_dump_is_passthrough() {
        let mut flash = ExternalFlash::new();
        flash.load(&[0x11, 0x22, 0x33, 0x44], true);
        flash.configure_otf(&otf_config());
        assert_eq!(flash.read32(BASE), 0x4433_2211);
        assert_eq!(flash.read16(BASE + 2), 0x4433);
    }

    #[test]
    fn encrypted_dump_round_trips_through_otfdec() {
        // Build the ciphertext by running the decryptor forward over the
        // plaintext (CTR is an involution), then check reads see plaintext.
        let plain = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let config = otf_config();
        let forward = OtfDec::new(
            &config.key,
            &config.nonce,
            config.version,
            config.region,
            config.start,
            config.end,
        );
        let mut cipher = plain;
        forward.decrypt(BASE, &mut cipher);

        let mut flash = ExternalFlash::new();
        flash.load(&cipher, false);
        flash.configure_otf(&config);
        assert_eq!(flash.read32(BASE), 0xEFBE_ADDE);
        assert_eq!(flash.read32(BASE + 4), 0x0403_0201);
        assert_eq!(flash.read8(BASE + 1), 0xAD);
    }

    #[test]
    fn region_outside_otf_window_is_passthrough() {
        let mut flash = ExternalFlash::new();
        let mut image = vec![0u8; 0xFF000];
        image.extend_from_slice(&[0x5A; 0x100]);
        flash.load(&image, false);
        let mut config = otf_config();
        config.end = 0x9000_0FFF; // narrow window
        flash.configure_otf(&config);
        assert_eq!(flash.read8(BASE + 0xFF000), 0x5A);
    }

    #[test]
    fn reads_past_the_image_return_erased_bytes() {
        let flash = ExternalFlash::new();
        assert_eq!(flash.read32(BASE + SIZE as u32 - 4), 0xFFFF_FFFF);
    }
}
