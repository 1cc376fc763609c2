//! Emoji shared by the terminal renderers.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Plan indicators
pub static STAGE: Emoji<'_, '_> = Emoji("📦 ", "[S]");
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[PIVOT]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

// Output indicators
pub static KEY: Emoji<'_, '_> = Emoji("🔑 ", "[ROLE]");
pub static EXPORT: Emoji<'_, '_> = Emoji("📤 ", "[OUT]");
