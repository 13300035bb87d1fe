//! Shared UI icons with ASCII fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

// Lifecycle indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static WAITING: Emoji<'_, '_> = Emoji("⏳ ", "[..]");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP]");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
