//! Shared UI icons with ASCII fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Artifacts
pub static BRANCH: Emoji<'_, '_> = Emoji("🌿 ", "[BR]");
pub static CLOUD: Emoji<'_, '_> = Emoji("☁️  ", "[INFRA]");
pub static LOCK: Emoji<'_, '_> = Emoji("🔒 ", "[RES]");
