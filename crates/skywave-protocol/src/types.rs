use serde::{Deserialize, Serialize};

/// Persistent user identifier, assigned at registration.
pub type UserId = u32;

/// Channel identifier. Channel 0 is always the root.
pub type ChannelId = u32;

/// Ephemeral session identifier, unique for the lifetime of a server run.
pub type SessionId = u32;

/// Sequence number for voice packets, monotonically increasing per speaker.
pub type SequenceNumber = u32;

/// Amateur-radio bands the server models, in descending wavelength order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    Band160m,
    Band80m,
    Band40m,
    Band30m,
    Band20m,
    Band17m,
    Band15m,
    Band12m,
    Band10m,
}

impl Band {
    /// Nominal carrier frequency in MHz, used when comparing against the MUF.
    pub fn frequency_mhz(self) -> f64 {
        match self {
            Band::Band160m => 1.8,
            Band::Band80m => 3.5,
            Band::Band40m => 7.0,
            Band::Band30m => 10.1,
            Band::Band20m => 14.0,
            Band::Band17m => 18.1,
            Band::Band15m => 21.0,
            Band::Band12m => 24.9,
            Band::Band10m => 28.0,
        }
    }

    /// Wavelength label in meters, as shown in channel names ("20m").
    pub fn meters(self) -> u16 {
        match self {
            Band::Band160m => 160,
            Band::Band80m => 80,
            Band::Band40m => 40,
            Band::Band30m => 30,
            Band::Band20m => 20,
            Band::Band17m => 17,
            Band::Band15m => 15,
            Band::Band12m => 12,
            Band::Band10m => 10,
        }
    }

    pub fn label(self) -> String {
        format!("{}m", self.meters())
    }

    /// Parse a wavelength label ("20m", case-insensitive, padding ignored).
    pub fn from_label(label: &str) -> Option<Band> {
        Self::LADDER
            .iter()
            .copied()
            .find(|b| b.label().eq_ignore_ascii_case(label.trim()))
    }

    /// All modeled bands, shortest wavelength first (the recommendation ladder).
    pub const LADDER: [Band; 9] = [
        Band::Band10m,
        Band::Band12m,
        Band::Band15m,
        Band::Band17m,
        Band::Band20m,
        Band::Band30m,
        Band::Band40m,
        Band::Band80m,
        Band::Band160m,
    ];
}

/// Season index used by the ionospheric model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Season {
    Winter = 0,
    Spring = 1,
    Summer = 2,
    Fall = 3,
}

impl Season {
    pub fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Season::Winter),
            1 => Some(Season::Spring),
            2 => Some(Season::Summer),
            3 => Some(Season::Fall),
            _ => None,
        }
    }

    /// Season for a UTC month (1-12), northern-hemisphere convention.
    pub fn from_month(month: u32) -> Self {
        match month {
            12 | 1 | 2 => Season::Winter,
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            _ => Season::Fall,
        }
    }
}

/// Channel permission bits, evaluated by the ACL walk.
///
/// The set is closed; bit positions are wire-visible in PermissionDenied and
/// PermissionQuery and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const ENTER: Permissions = Permissions(0x0001);
    pub const TRAVERSE: Permissions = Permissions(0x0002);
    pub const SPEAK: Permissions = Permissions(0x0004);
    pub const WHISPER: Permissions = Permissions(0x0008);
    pub const TEXT_MESSAGE: Permissions = Permissions(0x0010);
    pub const MAKE_CHANNEL: Permissions = Permissions(0x0020);
    pub const LINK_CHANNEL: Permissions = Permissions(0x0040);
    pub const MUTE_DEAFEN: Permissions = Permissions(0x0080);
    pub const MOVE: Permissions = Permissions(0x0100);
    pub const LISTEN: Permissions = Permissions(0x0200);
    pub const MAKE_TEMP_CHANNEL: Permissions = Permissions(0x0400);
    pub const SET_GRID_LOCATOR: Permissions = Permissions(0x0800);
    pub const MODIFY_BANDPLAN: Permissions = Permissions(0x1000);
    pub const CONFIGURE_PROPAGATION: Permissions = Permissions(0x2000);

    /// Default grant for an unprivileged user at the root.
    pub const DEFAULT: Permissions = Permissions(
        Self::ENTER.0
            | Self::TRAVERSE.0
            | Self::SPEAK.0
            | Self::WHISPER.0
            | Self::TEXT_MESSAGE.0
            | Self::LISTEN.0
            | Self::SET_GRID_LOCATOR.0,
    );

    /// Every defined bit.
    pub const ALL: Permissions = Permissions(0x3FFF);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub fn difference(self, other: Permissions) -> Permissions {
        Permissions(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a config-file permission name ("enter", "speak", ...).
    pub fn from_name(name: &str) -> Option<Permissions> {
        match name {
            "enter" => Some(Self::ENTER),
            "traverse" => Some(Self::TRAVERSE),
            "speak" => Some(Self::SPEAK),
            "whisper" => Some(Self::WHISPER),
            "textmessage" => Some(Self::TEXT_MESSAGE),
            "makechannel" => Some(Self::MAKE_CHANNEL),
            "linkchannel" => Some(Self::LINK_CHANNEL),
            "mutedeafen" => Some(Self::MUTE_DEAFEN),
            "move" => Some(Self::MOVE),
            "listen" => Some(Self::LISTEN),
            "maketempchannel" => Some(Self::MAKE_TEMP_CHANNEL),
            "setgridlocator" => Some(Self::SET_GRID_LOCATOR),
            "modifybandplan" => Some(Self::MODIFY_BANDPLAN),
            "configurepropagation" => Some(Self::CONFIGURE_PROPAGATION),
            "all" => Some(Self::ALL),
            _ => None,
        }
    }
}

/// Small integer tags keying the persisted user property map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UserProperty {
    Name = 0,
    Comment = 1,
    Email = 2,
    TextureBlob = 3,
    LastSeen = 4,
    LastChannel = 5,
    GridLocator = 6,
    PreferredBand = 7,
    Admin = 8,
    ListeningOnly = 9,
    AntennaGainDbi = 10,
    AntennaHeightM = 11,
}

/// Volume adjustment carried by a listener binding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeAdjustment {
    pub kind: VolumeAdjustmentKind,
    /// Clamped to [0, 10] on construction. 1.0 is identity for both kinds.
    pub factor: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeAdjustmentKind {
    Multiplicative,
    Logarithmic,
}

impl VolumeAdjustment {
    pub fn new(kind: VolumeAdjustmentKind, factor: f32) -> Self {
        Self {
            kind,
            factor: factor.clamp(0.0, 10.0),
        }
    }

    /// Identity adjustment (packets pass unscaled).
    pub fn identity() -> Self {
        Self::new(VolumeAdjustmentKind::Multiplicative, 1.0)
    }

    /// Muted-but-bound adjustment used when a listener is disabled.
    pub fn silenced() -> Self {
        Self::new(VolumeAdjustmentKind::Multiplicative, 0.0)
    }

    /// Linear gain to tag forwarded packets with.
    pub fn gain(&self) -> f32 {
        match self.kind {
            VolumeAdjustmentKind::Multiplicative => self.factor,
            // Interpret the factor as a dB-per-unit slope around identity.
            VolumeAdjustmentKind::Logarithmic => {
                if self.factor <= 0.0 {
                    0.0
                } else {
                    10f32.powf((self.factor - 1.0) / 2.0)
                }
            }
        }
    }
}

impl Default for VolumeAdjustment {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_ladder_order() {
        assert_eq!(Band::LADDER[0], Band::Band10m);
        assert_eq!(Band::LADDER[8], Band::Band160m);
        for pair in Band::LADDER.windows(2) {
            assert!(pair[0].frequency_mhz() > pair[1].frequency_mhz());
        }
    }

    #[test]
    fn band_labels() {
        assert_eq!(Band::Band20m.label(), "20m");
        assert_eq!(Band::Band160m.meters(), 160);
        assert_eq!(Band::from_label(" 40M "), Some(Band::Band40m));
        assert_eq!(Band::from_label("lounge"), None);
    }

    #[test]
    fn season_from_month() {
        assert_eq!(Season::from_month(1), Season::Winter);
        assert_eq!(Season::from_month(4), Season::Spring);
        assert_eq!(Season::from_month(7), Season::Summer);
        assert_eq!(Season::from_month(10), Season::Fall);
        assert_eq!(Season::from_month(12), Season::Winter);
    }

    #[test]
    fn season_from_index_bounds() {
        assert_eq!(Season::from_index(0), Some(Season::Winter));
        assert_eq!(Season::from_index(3), Some(Season::Fall));
        assert_eq!(Season::from_index(4), None);
    }

    #[test]
    fn permissions_set_operations() {
        let p = Permissions::ENTER.union(Permissions::SPEAK);
        assert!(p.contains(Permissions::ENTER));
        assert!(p.contains(Permissions::SPEAK));
        assert!(!p.contains(Permissions::LISTEN));
        let q = p.difference(Permissions::SPEAK);
        assert!(q.contains(Permissions::ENTER));
        assert!(!q.contains(Permissions::SPEAK));
    }

    #[test]
    fn permissions_default_excludes_admin_bits() {
        assert!(!Permissions::DEFAULT.contains(Permissions::CONFIGURE_PROPAGATION));
        assert!(!Permissions::DEFAULT.contains(Permissions::MODIFY_BANDPLAN));
        assert!(Permissions::DEFAULT.contains(Permissions::SET_GRID_LOCATOR));
    }

    #[test]
    fn permissions_from_name() {
        assert_eq!(Permissions::from_name("speak"), Some(Permissions::SPEAK));
        assert_eq!(
            Permissions::from_name("configurepropagation"),
            Some(Permissions::CONFIGURE_PROPAGATION)
        );
        assert_eq!(Permissions::from_name("fly"), None);
    }

    #[test]
    fn volume_adjustment_clamped() {
        let v = VolumeAdjustment::new(VolumeAdjustmentKind::Multiplicative, 25.0);
        assert_eq!(v.factor, 10.0);
        let v = VolumeAdjustment::new(VolumeAdjustmentKind::Multiplicative, -1.0);
        assert_eq!(v.factor, 0.0);
    }

    #[test]
    fn volume_adjustment_gain() {
        assert_eq!(VolumeAdjustment::identity().gain(), 1.0);
        assert_eq!(VolumeAdjustment::silenced().gain(), 0.0);
        let log = VolumeAdjustment::new(VolumeAdjustmentKind::Logarithmic, 1.0);
        assert!((log.gain() - 1.0).abs() < 1e-6);
    }
}
