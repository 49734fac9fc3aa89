// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replication meta-data sizing.
//!
//! The replication daemon keeps its bookkeeping (activity log and one dirty
//! bitmap per peer) at the end of the backing device, so a backing volume
//! must be allocated larger than the usable size the user asked for. The
//! arithmetic here mirrors the daemon's internal layout: get it wrong and
//! the daemon refuses to create its meta data.

/// Default number of activity log stripes.
pub const DEFAULT_AL_STRIPES: u32 = 1;

/// Default size of one activity log stripe in KiB.
pub const DEFAULT_AL_STRIPE_SIZE_KIB: u64 = 32;

/// Peer slot bounds accepted by the replication daemon.
pub const MIN_PEER_SLOTS: u8 = 1;
pub const MAX_PEER_SLOTS: u8 = 31;

/// Largest usable volume size the daemon supports: 1 PiB.
pub const MAX_NET_SIZE_KIB: u64 = 1 << 40;

// One bitmap bit tracks a 4 KiB grain of the volume.
const BITMAP_GRAIN_KIB: u64 = 4;
// Meta-data sections are aligned to 4 KiB.
const ALIGN_KIB: u64 = 4;
// Fixed-size superblock at the very end of the device.
const SUPERBLOCK_KIB: u64 = 4;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetaDataError {
    #[error(
        "peer slot count {0} is outside the supported range \
         {MIN_PEER_SLOTS}..={MAX_PEER_SLOTS}"
    )]
    PeerSlots(u8),
    #[error(
        "volume size {net_kib} KiB exceeds the supported maximum of \
         {MAX_NET_SIZE_KIB} KiB"
    )]
    VolumeTooLarge { net_kib: u64 },
    #[error(
        "invalid activity log geometry: {stripes} stripes of \
         {stripe_size_kib} KiB"
    )]
    ActivityLog { stripes: u32, stripe_size_kib: u64 },
}

fn align_up(kib: u64) -> u64 {
    kib.div_ceil(ALIGN_KIB) * ALIGN_KIB
}

/// Size of the meta-data area for a volume of usable size `net_kib` with
/// `peer_slots` peers.
pub fn meta_data_size(
    net_kib: u64,
    peer_slots: u8,
    al_stripes: u32,
    al_stripe_size_kib: u64,
) -> Result<u64, MetaDataError> {
    if !(MIN_PEER_SLOTS..=MAX_PEER_SLOTS).contains(&peer_slots) {
        return Err(MetaDataError::PeerSlots(peer_slots));
    }
    if net_kib > MAX_NET_SIZE_KIB {
        return Err(MetaDataError::VolumeTooLarge { net_kib });
    }
    if al_stripes == 0 || al_stripe_size_kib < ALIGN_KIB {
        return Err(MetaDataError::ActivityLog {
            stripes: al_stripes,
            stripe_size_kib: al_stripe_size_kib,
        });
    }

    let al_kib = align_up(u64::from(al_stripes) * al_stripe_size_kib);
    // Bits -> bytes -> KiB, each rounded up, then aligned per peer.
    let bitmap_bits = net_kib.div_ceil(BITMAP_GRAIN_KIB);
    let bitmap_kib = align_up(bitmap_bits.div_ceil(8).div_ceil(1024));
    Ok(al_kib + u64::from(peer_slots) * bitmap_kib + SUPERBLOCK_KIB)
}

/// Size the backing volume must be allocated at so that a volume of usable
/// size `net_kib` fits together with its meta data.
///
/// Strictly increasing in `net_kib` for fixed peer count and activity log
/// geometry.
pub fn gross_size(
    net_kib: u64,
    peer_slots: u8,
    al_stripes: u32,
    al_stripe_size_kib: u64,
) -> Result<u64, MetaDataError> {
    let md_kib =
        meta_data_size(net_kib, peer_slots, al_stripes, al_stripe_size_kib)?;
    Ok(net_kib + md_kib)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn small_volume_overhead() {
        // 1 GiB, 7 peers: 32 KiB activity log, 32 KiB bitmap per peer
        // (1 GiB / 4 KiB grains = 256 Ki bits = 32 KiB), 4 KiB superblock.
        let gross =
            gross_size(1 << 20, 7, DEFAULT_AL_STRIPES, DEFAULT_AL_STRIPE_SIZE_KIB)
                .unwrap();
        assert_eq!(gross, (1 << 20) + 32 + 7 * 32 + 4);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        assert_eq!(
            gross_size(1024, 0, DEFAULT_AL_STRIPES, DEFAULT_AL_STRIPE_SIZE_KIB),
            Err(MetaDataError::PeerSlots(0))
        );
        assert_eq!(
            gross_size(1024, 32, DEFAULT_AL_STRIPES, DEFAULT_AL_STRIPE_SIZE_KIB),
            Err(MetaDataError::PeerSlots(32))
        );
        assert!(matches!(
            gross_size(
                MAX_NET_SIZE_KIB + 1,
                7,
                DEFAULT_AL_STRIPES,
                DEFAULT_AL_STRIPE_SIZE_KIB
            ),
            Err(MetaDataError::VolumeTooLarge { .. })
        ));
        assert!(matches!(
            gross_size(1024, 7, 0, DEFAULT_AL_STRIPE_SIZE_KIB),
            Err(MetaDataError::ActivityLog { .. })
        ));
    }

    #[proptest]
    fn gross_size_strictly_monotonic(
        #[strategy(0u64..1 << 30)] net_kib: u64,
        #[strategy(1u64..1 << 20)] increment: u64,
        #[strategy(1u8..=31)] peer_slots: u8,
    ) {
        let smaller = gross_size(
            net_kib,
            peer_slots,
            DEFAULT_AL_STRIPES,
            DEFAULT_AL_STRIPE_SIZE_KIB,
        )
        .unwrap();
        let larger = gross_size(
            net_kib + increment,
            peer_slots,
            DEFAULT_AL_STRIPES,
            DEFAULT_AL_STRIPE_SIZE_KIB,
        )
        .unwrap();
        assert!(larger > smaller);
    }

    #[proptest]
    fn gross_size_is_deterministic(
        #[strategy(0u64..MAX_NET_SIZE_KIB)] net_kib: u64,
        #[strategy(1u8..=31)] peer_slots: u8,
    ) {
        let first = gross_size(
            net_kib,
            peer_slots,
            DEFAULT_AL_STRIPES,
            DEFAULT_AL_STRIPE_SIZE_KIB,
        );
        let second = gross_size(
            net_kib,
            peer_slots,
            DEFAULT_AL_STRIPES,
            DEFAULT_AL_STRIPE_SIZE_KIB,
        );
        assert_eq!(first, second);
    }
}
