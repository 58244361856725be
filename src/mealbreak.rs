//! Meal-break reason inference
//!
//! Readers rarely have the meal-break reason key pressed, so the client
//! assigns it after the fact by looking at the stampings already delivered
//! for the same badge in the current session. A reason explicitly selected
//! on the reader is never overwritten.

use crate::config::MealBreakConfig;
use crate::{Reason, Stamping};
use tracing::debug;

/// Whether this would be the badge's first entrance of the session.
fn is_first_entrance(stamping: &Stamping, already_sent: &[Stamping]) -> bool {
    stamping.is_entrance() && !already_sent.iter().any(Stamping::is_entrance)
}

/// Assign the meal-break reason where the session shape implies one.
///
/// Two rules apply, in order:
///
/// 1. A stamping inside the `[min_hour, max_hour)` window gets the
///    meal-break reason, unless it is the badge's first entrance of the
///    session (arriving at work during lunch hours is not a break).
/// 2. An entrance following an exit that carried the meal-break reason
///    closes that break and gets the reason regardless of the hour window.
///    "Following" is judged on the latest already-sent stamping by
///    time of day.
pub fn infer_meal_break(
    stamping: &mut Stamping,
    already_sent: &[Stamping],
    window: &MealBreakConfig,
) {
    if stamping.has_reason() {
        return;
    }

    if !is_first_entrance(stamping, already_sent)
        && stamping.hour >= window.min_hour
        && stamping.hour < window.max_hour
    {
        debug!(
            badge = stamping.badge_id.as_deref(),
            hour = stamping.hour,
            "assigning meal-break reason from hour window"
        );
        stamping.reason = Some(Reason::MealBreak);
        return;
    }

    let latest = already_sent.iter().max_by_key(|s| s.time_key());
    if let Some(latest) = latest {
        if stamping.is_entrance() && latest.is_exit() && latest.reason == Some(Reason::MealBreak) {
            debug!(
                badge = stamping.badge_id.as_deref(),
                "assigning meal-break reason to close the previous break"
            );
            stamping.reason = Some(Reason::MealBreak);
        }
    }
}
