use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Validate a requested rental window and build its span.
pub(crate) fn validate_window(pickup: Ms, expected_return: Ms) -> Result<Span, EngineError> {
    if pickup >= expected_return {
        return Err(EngineError::Validation("return must be after pickup"));
    }
    if pickup < MIN_VALID_TIMESTAMP_MS || expected_return > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if expected_return - pickup > MAX_RENTAL_DURATION_MS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(Span::new(pickup, expected_return))
}

/// First active reservation whose window intersects `span`, skipping
/// `exclude` (the reservation being re-checked, if any).
pub fn first_conflict<'a>(
    book: &'a ResourceBook,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Option<&'a Reservation> {
    book.active_overlapping(span)
        .find(|r| Some(r.id) != exclude)
}

/// Back-to-back bookings (`end1 == start2`) never conflict.
pub fn is_available(book: &ResourceBook, span: &Span) -> bool {
    first_conflict(book, span, None).is_none()
}

pub(crate) fn check_available(book: &ResourceBook, span: &Span) -> Result<(), EngineError> {
    match first_conflict(book, span, None) {
        Some(existing) => Err(EngineError::ResourceUnavailable(existing.id)),
        None => Ok(()),
    }
}
