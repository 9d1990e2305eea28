//! Numeric locale handling for unit formatting.
//!
//! Formatting always runs against the calling thread's *current* numeric
//! locale, which defaults to the C locale (`.` decimal point). Callers that
//! want the user's display locale switch to it through a [`LocaleGuard`],
//! which puts the previous locale back when dropped, so a switch never
//! leaks past the formatting call that made it.

use std::cell::Cell;
use std::sync::Mutex;

/// The parts of a numeric locale that affect number rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericLocale {
    pub decimal_point: char,
}

impl NumericLocale {
    /// The "C" / POSIX locale.
    pub const C: NumericLocale = NumericLocale { decimal_point: '.' };

    /// Locale with a comma decimal point (de_DE, fr_FR, ...).
    pub const COMMA: NumericLocale = NumericLocale { decimal_point: ',' };

    /// Best-effort lookup from a POSIX locale name such as `de_DE.UTF-8`.
    pub fn from_name(name: &str) -> NumericLocale {
        let lang = name
            .split(['_', '.', '-'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match lang.as_str() {
            "de" | "fr" | "es" | "it" | "nl" | "pt" | "ru" | "pl" | "sv" | "da" | "fi"
            | "nb" | "cs" | "tr" => NumericLocale::COMMA,
            _ => NumericLocale::C,
        }
    }

    /// Read the display locale from `LC_NUMERIC` / `LC_ALL` / `LANG`.
    pub fn from_environment() -> NumericLocale {
        for var in ["LC_ALL", "LC_NUMERIC", "LANG"] {
            if let Ok(v) = std::env::var(var) {
                if !v.is_empty() {
                    return NumericLocale::from_name(&v);
                }
            }
        }
        NumericLocale::C
    }
}

impl Default for NumericLocale {
    fn default() -> Self {
        NumericLocale::C
    }
}

static DISPLAY_LOCALE: Mutex<NumericLocale> = Mutex::new(NumericLocale::C);

thread_local! {
    static CURRENT_LOCALE: Cell<NumericLocale> = const { Cell::new(NumericLocale::C) };
}

/// Set the process-wide display locale used when formatting for humans.
pub fn set_display_locale(locale: NumericLocale) {
    match DISPLAY_LOCALE.lock() {
        Ok(mut guard) => *guard = locale,
        Err(poisoned) => *poisoned.into_inner() = locale,
    }
}

/// The process-wide display locale.
pub fn display_locale() -> NumericLocale {
    match DISPLAY_LOCALE.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// The numeric locale currently active on this thread.
pub fn current_locale() -> NumericLocale {
    CURRENT_LOCALE.with(|c| c.get())
}

/// RAII switch of the current thread's numeric locale.
#[must_use = "the previous locale is restored when the guard is dropped"]
pub struct LocaleGuard {
    previous: NumericLocale,
}

impl LocaleGuard {
    pub fn switch_to(locale: NumericLocale) -> Self {
        let previous = CURRENT_LOCALE.with(|c| c.replace(locale));
        Self { previous }
    }

    /// Switch to the display locale if `use_display` is set, otherwise keep
    /// the current one (still restoring it on drop).
    pub fn for_display(use_display: bool) -> Self {
        if use_display {
            Self::switch_to(display_locale())
        } else {
            Self::switch_to(current_locale())
        }
    }
}

impl Drop for LocaleGuard {
    fn drop(&mut self) {
        CURRENT_LOCALE.with(|c| c.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(NumericLocale::from_name("de_DE.UTF-8"), NumericLocale::COMMA);
        assert_eq!(NumericLocale::from_name("en_US.UTF-8"), NumericLocale::C);
        assert_eq!(NumericLocale::from_name("C"), NumericLocale::C);
    }

    #[test]
    fn test_guard_restores_previous() {
        assert_eq!(current_locale(), NumericLocale::C);
        {
            let _g = LocaleGuard::switch_to(NumericLocale::COMMA);
            assert_eq!(current_locale(), NumericLocale::COMMA);
            {
                let _inner = LocaleGuard::switch_to(NumericLocale::C);
                assert_eq!(current_locale(), NumericLocale::C);
            }
            assert_eq!(current_locale(), NumericLocale::COMMA);
        }
        assert_eq!(current_locale(), NumericLocale::C);
    }

    #[test]
    fn test_switch_does_not_bleed_across_threads() {
        let _g = LocaleGuard::switch_to(NumericLocale::COMMA);
        let other = std::thread::spawn(current_locale).join().unwrap();
        assert_eq!(other, NumericLocale::C);
    }
}
