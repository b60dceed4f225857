//! Platform permission flags and the name registry used by policy modules.
//!
//! Bit positions follow the platform's native permission vocabulary:
//! - General (bits 0-10): Invites, moderation basics, administration
//! - Text (bits 11-19): Messaging and content
//! - Voice (bits 20-25): Voice channel permissions
//! - Management (bits 26-34): Nicknames, roles, webhooks, events, threads
//! - Extended (bits 35-50): Threads, stickers, activities, timeouts, polls

use bitflags::bitflags;

bitflags! {
    /// Permission bitmask.
    ///
    /// Backed by `u128` so every mask the registry can produce, and every
    /// mask a policy snapshot can carry, survives without truncation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u128 {
        // === General (bits 0-10) ===
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS          = 1 << 1;
        const BAN_MEMBERS           = 1 << 2;
        /// Grants every permission natively; policy can still narrow it.
        const ADMINISTRATOR         = 1 << 3;
        const MANAGE_CHANNELS       = 1 << 4;
        const MANAGE_GUILD          = 1 << 5;
        const ADD_REACTIONS         = 1 << 6;
        const VIEW_AUDIT_LOG        = 1 << 7;
        const PRIORITY_SPEAKER      = 1 << 8;
        const STREAM                = 1 << 9;
        const VIEW_CHANNEL          = 1 << 10;

        // === Text (bits 11-19) ===
        const SEND_MESSAGES         = 1 << 11;
        const SEND_TTS_MESSAGES     = 1 << 12;
        const MANAGE_MESSAGES       = 1 << 13;
        const EMBED_LINKS           = 1 << 14;
        const ATTACH_FILES          = 1 << 15;
        const READ_MESSAGE_HISTORY  = 1 << 16;
        const MENTION_EVERYONE      = 1 << 17;
        const USE_EXTERNAL_EMOJIS   = 1 << 18;
        const VIEW_GUILD_INSIGHTS   = 1 << 19;

        // === Voice (bits 20-25) ===
        const CONNECT               = 1 << 20;
        const SPEAK                 = 1 << 21;
        const MUTE_MEMBERS          = 1 << 22;
        const DEAFEN_MEMBERS        = 1 << 23;
        const MOVE_MEMBERS          = 1 << 24;
        const USE_VAD               = 1 << 25;

        // === Management (bits 26-34) ===
        const CHANGE_NICKNAME       = 1 << 26;
        const MANAGE_NICKNAMES      = 1 << 27;
        const MANAGE_ROLES          = 1 << 28;
        const MANAGE_WEBHOOKS       = 1 << 29;
        const MANAGE_GUILD_EXPRESSIONS = 1 << 30;
        const USE_APPLICATION_COMMANDS = 1 << 31;
        const REQUEST_TO_SPEAK      = 1 << 32;
        const MANAGE_EVENTS         = 1 << 33;
        const MANAGE_THREADS        = 1 << 34;

        // === Extended (bits 35-50) ===
        const CREATE_PUBLIC_THREADS = 1 << 35;
        const CREATE_PRIVATE_THREADS = 1 << 36;
        const USE_EXTERNAL_STICKERS = 1 << 37;
        const SEND_MESSAGES_IN_THREADS = 1 << 38;
        const USE_EMBEDDED_ACTIVITIES = 1 << 39;
        const MODERATE_MEMBERS      = 1 << 40;
        const VIEW_CREATOR_MONETIZATION_ANALYTICS = 1 << 41;
        const USE_SOUNDBOARD        = 1 << 42;
        const CREATE_GUILD_EXPRESSIONS = 1 << 43;
        const CREATE_EVENTS         = 1 << 44;
        const USE_EXTERNAL_SOUNDS   = 1 << 45;
        const SEND_VOICE_MESSAGES   = 1 << 46;
        const SEND_POLLS            = 1 << 49;
        const USE_EXTERNAL_APPS     = 1 << 50;
    }
}

impl Permissions {
    /// Check if this permission set includes the specified permission(s).
    ///
    /// # Examples
    ///
    /// ```
    /// use vc_policy::Permissions;
    ///
    /// let perms = Permissions::SEND_MESSAGES | Permissions::CONNECT;
    /// assert!(perms.has(Permissions::SEND_MESSAGES));
    /// assert!(!perms.has(Permissions::BAN_MEMBERS));
    /// ```
    #[must_use]
    pub const fn has(self, permission: Self) -> bool {
        self.contains(permission)
    }

    /// Deny-masked union: `(self | allow) & !deny`.
    #[must_use]
    pub const fn grant_masked(self, allow: Self, deny: Self) -> Self {
        Self::from_bits_retain((self.bits() | allow.bits()) & !deny.bits())
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::empty()
    }
}

/// Version of the permission vocabulary below. Bump when names or bits change.
pub const REGISTRY_VERSION: u32 = 1;

/// DSL name -> flag. Names are the identifiers accepted inside
/// `allow`/`deny` permission lists.
const PERMISSION_NAMES: &[(&str, Permissions)] = &[
    ("CreateInstantInvite", Permissions::CREATE_INSTANT_INVITE),
    ("KickMembers", Permissions::KICK_MEMBERS),
    ("BanMembers", Permissions::BAN_MEMBERS),
    ("Administrator", Permissions::ADMINISTRATOR),
    ("ManageChannels", Permissions::MANAGE_CHANNELS),
    ("ManageGuild", Permissions::MANAGE_GUILD),
    ("AddReactions", Permissions::ADD_REACTIONS),
    ("ViewAuditLog", Permissions::VIEW_AUDIT_LOG),
    ("PrioritySpeaker", Permissions::PRIORITY_SPEAKER),
    ("Stream", Permissions::STREAM),
    ("ViewChannel", Permissions::VIEW_CHANNEL),
    ("SendMessages", Permissions::SEND_MESSAGES),
    ("SendTTSMessages", Permissions::SEND_TTS_MESSAGES),
    ("ManageMessages", Permissions::MANAGE_MESSAGES),
    ("EmbedLinks", Permissions::EMBED_LINKS),
    ("AttachFiles", Permissions::ATTACH_FILES),
    ("ReadMessageHistory", Permissions::READ_MESSAGE_HISTORY),
    ("MentionEveryone", Permissions::MENTION_EVERYONE),
    ("UseExternalEmojis", Permissions::USE_EXTERNAL_EMOJIS),
    ("ViewGuildInsights", Permissions::VIEW_GUILD_INSIGHTS),
    ("Connect", Permissions::CONNECT),
    ("Speak", Permissions::SPEAK),
    ("MuteMembers", Permissions::MUTE_MEMBERS),
    ("DeafenMembers", Permissions::DEAFEN_MEMBERS),
    ("MoveMembers", Permissions::MOVE_MEMBERS),
    ("UseVAD", Permissions::USE_VAD),
    ("ChangeNickname", Permissions::CHANGE_NICKNAME),
    ("ManageNicknames", Permissions::MANAGE_NICKNAMES),
    ("ManageRoles", Permissions::MANAGE_ROLES),
    ("ManageWebhooks", Permissions::MANAGE_WEBHOOKS),
    ("ManageGuildExpressions", Permissions::MANAGE_GUILD_EXPRESSIONS),
    ("UseApplicationCommands", Permissions::USE_APPLICATION_COMMANDS),
    ("RequestToSpeak", Permissions::REQUEST_TO_SPEAK),
    ("ManageEvents", Permissions::MANAGE_EVENTS),
    ("ManageThreads", Permissions::MANAGE_THREADS),
    ("CreatePublicThreads", Permissions::CREATE_PUBLIC_THREADS),
    ("CreatePrivateThreads", Permissions::CREATE_PRIVATE_THREADS),
    ("UseExternalStickers", Permissions::USE_EXTERNAL_STICKERS),
    ("SendMessagesInThreads", Permissions::SEND_MESSAGES_IN_THREADS),
    ("UseEmbeddedActivities", Permissions::USE_EMBEDDED_ACTIVITIES),
    ("ModerateMembers", Permissions::MODERATE_MEMBERS),
    (
        "ViewCreatorMonetizationAnalytics",
        Permissions::VIEW_CREATOR_MONETIZATION_ANALYTICS,
    ),
    ("UseSoundboard", Permissions::USE_SOUNDBOARD),
    ("CreateGuildExpressions", Permissions::CREATE_GUILD_EXPRESSIONS),
    ("CreateEvents", Permissions::CREATE_EVENTS),
    ("UseExternalSounds", Permissions::USE_EXTERNAL_SOUNDS),
    ("SendVoiceMessages", Permissions::SEND_VOICE_MESSAGES),
    ("SendPolls", Permissions::SEND_POLLS),
    ("UseExternalApps", Permissions::USE_EXTERNAL_APPS),
];

/// Named permission vocabulary consulted while compiling `allow`/`deny` rules.
pub trait PermissionRegistry: Send + Sync {
    /// Vocabulary version.
    fn version(&self) -> u32;

    /// Resolve a permission identifier to its flag(s).
    fn resolve(&self, name: &str) -> Option<Permissions>;

    /// Every known name with its flag, in bit order.
    fn names(&self) -> Vec<(&'static str, Permissions)>;
}

/// The platform's built-in permission vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformRegistry;

impl PermissionRegistry for PlatformRegistry {
    fn version(&self) -> u32 {
        REGISTRY_VERSION
    }

    fn resolve(&self, name: &str) -> Option<Permissions> {
        PERMISSION_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, flag)| *flag)
    }

    fn names(&self) -> Vec<(&'static str, Permissions)> {
        PERMISSION_NAMES.to_vec()
    }
}
