use std::fmt;
use std::sync::Mutex;

use log::{debug, info};

use crate::error::TapeFlowError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CartridgeState {
    Unmounted,
    Mounted,
    Moving,
    InUse,
}

impl CartridgeState {
    pub fn full_name(&self) -> &'static str {
        match self {
            CartridgeState::Unmounted => "unmounted",
            CartridgeState::Mounted => "mounted",
            CartridgeState::Moving => "moving",
            CartridgeState::InUse => "in use",
        }
    }
}

impl fmt::Display for CartridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[derive(Debug, Clone)]
pub struct Drive {
    pub id: String,
    pub slot: usize,
    pub busy: bool,
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub id: String,
    pub slot: Option<usize>,
    pub state: CartridgeState,
}

struct InventoryInner {
    drives: Vec<Drive>,
    cartridges: Vec<Cartridge>,
}

/// A drive reserved for a recall by [`Inventory::claim_for_recall`].
#[derive(Debug, Clone)]
pub struct RecallClaim {
    pub drive_id: String,
    pub needs_mount: bool,
}

/// The scheduler's view of tape cartridges and drives.
///
/// Every operation is a single lock scope: targets are collected while
/// iterating and mutated in place, so no operation ever reenters the lock.
pub struct Inventory {
    inner: Mutex<InventoryInner>,
}

impl Inventory {
    pub fn new(drive_ids: &[String], cartridge_ids: &[String]) -> Self {
        let drives = drive_ids
            .iter()
            .enumerate()
            .map(|(slot, id)| Drive {
                id: id.clone(),
                slot,
                busy: false,
            })
            .collect();

        let cartridges = cartridge_ids
            .iter()
            .map(|id| Cartridge {
                id: id.clone(),
                slot: None,
                state: CartridgeState::Unmounted,
            })
            .collect();

        Inventory {
            inner: Mutex::new(InventoryInner { drives, cartridges }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InventoryInner> {
        self.inner.lock().expect("inventory mutex poisoned")
    }

    #[allow(dead_code)]
    pub fn cartridge_state(&self, tape_id: &str) -> Result<CartridgeState, TapeFlowError> {
        let inner = self.lock();
        inner
            .cartridges
            .iter()
            .find(|c| c.id == tape_id)
            .map(|c| c.state)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", tape_id)))
    }

    pub fn set_cartridge_state(
        &self,
        tape_id: &str,
        state: CartridgeState,
    ) -> Result<(), TapeFlowError> {
        let mut inner = self.lock();
        let cartridge = inner
            .cartridges
            .iter_mut()
            .find(|c| c.id == tape_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", tape_id)))?;
        cartridge.state = state;
        Ok(())
    }

    /// Admission check for a recall: is the cartridge mounted on a free
    /// drive, or can it be mounted on one? Reserves the drive on success.
    pub fn claim_for_recall(&self, tape_id: &str) -> Result<Option<RecallClaim>, TapeFlowError> {
        let mut inner = self.lock();

        let cartridge_idx = inner
            .cartridges
            .iter()
            .position(|c| c.id == tape_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", tape_id)))?;

        match inner.cartridges[cartridge_idx].state {
            CartridgeState::Mounted => {
                let slot = inner.cartridges[cartridge_idx]
                    .slot
                    .expect("mounted cartridge without a slot");
                let drive = match inner.drives.iter_mut().find(|d| d.slot == slot && !d.busy) {
                    Some(drive) => drive,
                    None => return Ok(None),
                };
                drive.busy = true;
                let drive_id = drive.id.clone();
                inner.cartridges[cartridge_idx].state = CartridgeState::InUse;
                debug!("Cartridge '{}' claimed on drive '{}'", tape_id, drive_id);
                Ok(Some(RecallClaim {
                    drive_id,
                    needs_mount: false,
                }))
            }
            CartridgeState::Unmounted => {
                let drive = match inner.drives.iter_mut().find(|d| !d.busy) {
                    Some(drive) => drive,
                    None => return Ok(None),
                };
                drive.busy = true;
                let drive_id = drive.id.clone();
                inner.cartridges[cartridge_idx].state = CartridgeState::Moving;
                debug!(
                    "Cartridge '{}' claimed for mount on drive '{}'",
                    tape_id, drive_id
                );
                Ok(Some(RecallClaim {
                    drive_id,
                    needs_mount: true,
                }))
            }
            state @ (CartridgeState::Moving | CartridgeState::InUse) => {
                debug!("Cartridge '{}' is {}, not claimable", tape_id, state);
                Ok(None)
            }
        }
    }

    /// Mounts a cartridge on a drive. Blocks until the physical action has
    /// completed and reflects the result in the inventory.
    pub fn mount(&self, drive_id: &str, cartridge_id: &str) -> Result<(), TapeFlowError> {
        info!("Mounting cartridge '{}' on drive '{}'", cartridge_id, drive_id);

        let mut inner = self.lock();
        let slot = inner
            .drives
            .iter()
            .find(|d| d.id == drive_id)
            .map(|d| d.slot)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown drive '{}'", drive_id)))?;

        let cartridge = inner
            .cartridges
            .iter_mut()
            .find(|c| c.id == cartridge_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", cartridge_id)))?;

        cartridge.slot = Some(slot);
        cartridge.state = CartridgeState::Mounted;
        Ok(())
    }

    /// Unmounts a cartridge and frees its drive.
    #[allow(dead_code)]
    pub fn unmount(&self, drive_id: &str, cartridge_id: &str) -> Result<(), TapeFlowError> {
        info!(
            "Unmounting cartridge '{}' from drive '{}'",
            cartridge_id, drive_id
        );

        let mut inner = self.lock();
        let cartridge = inner
            .cartridges
            .iter_mut()
            .find(|c| c.id == cartridge_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", cartridge_id)))?;
        cartridge.slot = None;
        cartridge.state = CartridgeState::Unmounted;

        let drive = inner
            .drives
            .iter_mut()
            .find(|d| d.id == drive_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown drive '{}'", drive_id)))?;
        drive.busy = false;
        Ok(())
    }

    /// Releases the resources of a finished recall: the cartridge goes back
    /// to mounted and the single drive holding it becomes free.
    pub fn release_after_recall(&self, tape_id: &str) -> Result<(), TapeFlowError> {
        let mut inner = self.lock();

        let cartridge = inner
            .cartridges
            .iter_mut()
            .find(|c| c.id == tape_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown cartridge '{}'", tape_id)))?;
        let slot = cartridge
            .slot
            .ok_or_else(|| TapeFlowError::Error(format!("Cartridge '{}' is not mounted", tape_id)))?;
        cartridge.state = CartridgeState::Mounted;

        let mut freed = 0;
        for drive in inner.drives.iter_mut().filter(|d| d.slot == slot) {
            drive.busy = false;
            freed += 1;
        }
        if freed != 1 {
            return Err(TapeFlowError::Error(format!(
                "Expected exactly one drive holding cartridge '{}', found {}",
                tape_id, freed
            )));
        }
        Ok(())
    }

    /// Undoes a claim whose mount failed.
    pub fn release_claim(&self, drive_id: &str, tape_id: &str) -> Result<(), TapeFlowError> {
        let mut inner = self.lock();

        if let Some(cartridge) = inner.cartridges.iter_mut().find(|c| c.id == tape_id) {
            cartridge.state = CartridgeState::Unmounted;
            cartridge.slot = None;
        }
        let drive = inner
            .drives
            .iter_mut()
            .find(|d| d.id == drive_id)
            .ok_or_else(|| TapeFlowError::Error(format!("Unknown drive '{}'", drive_id)))?;
        drive.busy = false;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn free_drives(&self) -> usize {
        self.lock().drives.iter().filter(|d| !d.busy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Inventory {
        Inventory::new(
            &["D00".to_string(), "D01".to_string()],
            &["T00001L6".to_string(), "T00002L6".to_string()],
        )
    }

    #[test]
    fn test_claim_mounted_cartridge_on_free_drive() {
        let inv = inventory();
        inv.mount("D00", "T00001L6").unwrap();

        let claim = inv
            .claim_for_recall("T00001L6")
            .unwrap()
            .expect("mounted cartridge should be claimable");
        assert_eq!(claim.drive_id, "D00");
        assert!(!claim.needs_mount);
        assert_eq!(inv.cartridge_state("T00001L6").unwrap(), CartridgeState::InUse);
        assert_eq!(inv.free_drives(), 1);

        // a second claim on the same cartridge must fail
        assert!(inv.claim_for_recall("T00001L6").unwrap().is_none());
    }

    #[test]
    fn test_claim_unmounted_cartridge_requests_mount() {
        let inv = inventory();

        let claim = inv
            .claim_for_recall("T00002L6")
            .unwrap()
            .expect("unmounted cartridge should claim a free drive");
        assert!(claim.needs_mount);
        assert_eq!(
            inv.cartridge_state("T00002L6").unwrap(),
            CartridgeState::Moving
        );

        inv.mount(&claim.drive_id, "T00002L6").unwrap();
        assert_eq!(
            inv.cartridge_state("T00002L6").unwrap(),
            CartridgeState::Mounted
        );
    }

    #[test]
    fn test_claim_fails_without_free_drive() {
        let inv = Inventory::new(
            &["D00".to_string()],
            &["T00001L6".to_string(), "T00002L6".to_string()],
        );
        inv.mount("D00", "T00001L6").unwrap();

        assert!(inv.claim_for_recall("T00001L6").unwrap().is_some());
        // the only drive is now busy
        assert!(inv.claim_for_recall("T00002L6").unwrap().is_none());
    }

    #[test]
    fn test_release_after_recall_frees_exactly_one_drive() {
        let inv = inventory();
        inv.mount("D01", "T00001L6").unwrap();
        inv.claim_for_recall("T00001L6").unwrap().unwrap();

        inv.release_after_recall("T00001L6").unwrap();
        assert_eq!(
            inv.cartridge_state("T00001L6").unwrap(),
            CartridgeState::Mounted
        );
        assert_eq!(inv.free_drives(), 2);
    }

    #[test]
    fn test_release_after_recall_requires_mounted_cartridge() {
        let inv = inventory();
        assert!(inv.release_after_recall("T00001L6").is_err());
    }

    #[test]
    fn test_unknown_cartridge_is_an_error() {
        let inv = inventory();
        assert!(inv.claim_for_recall("T99999L6").is_err());
        assert!(inv.cartridge_state("T99999L6").is_err());
    }

    #[test]
    fn test_release_claim_after_failed_mount() {
        let inv = inventory();
        let claim = inv.claim_for_recall("T00001L6").unwrap().unwrap();
        assert!(claim.needs_mount);

        inv.release_claim(&claim.drive_id, "T00001L6").unwrap();
        assert_eq!(
            inv.cartridge_state("T00001L6").unwrap(),
            CartridgeState::Unmounted
        );
        assert_eq!(inv.free_drives(), 2);
    }
}
