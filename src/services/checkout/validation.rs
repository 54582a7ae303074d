//! Per-step input checks. Each returns a field-keyed error map on failure.

use std::collections::HashMap;

use validator::Validate;

use crate::config::TicketTypeConfig;
use crate::entities::purchase::PaymentMethod;
use crate::errors::{FieldErrors, ServiceError};

use super::session::{
    AttendeeDetails, ContactInfo, PaymentDetails, PricedTicketLine, TicketLineInput,
    TicketSelection,
};

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub fn validate_contact(contact: &ContactInfo) -> Result<(), ServiceError> {
    contact.validate()?;
    Ok(())
}

/// Prices the requested lines from the catalog. Lines naming the same ticket
/// type are merged.
pub fn price_selection(
    lines: &[TicketLineInput],
    catalog: &[TicketTypeConfig],
) -> Result<TicketSelection, ServiceError> {
    let mut errors = FieldErrors::new();

    if lines.is_empty() {
        errors.add("tickets", "Select at least one ticket");
        return Err(ServiceError::ValidationError(errors));
    }

    let mut priced: Vec<PricedTicketLine> = Vec::new();
    let mut index_by_type: HashMap<String, usize> = HashMap::new();

    for (i, line) in lines.iter().enumerate() {
        let requested = line.ticket_type.trim();
        let Some(ticket) = catalog
            .iter()
            .find(|ticket| ticket.name.eq_ignore_ascii_case(requested))
        else {
            errors.add(
                format!("tickets[{}].ticket_type", i),
                format!("Unknown ticket type '{}'", requested),
            );
            continue;
        };

        if line.quantity == 0 {
            errors.add(
                format!("tickets[{}].quantity", i),
                "Quantity must be at least 1",
            );
            continue;
        }

        match index_by_type.get(&ticket.name) {
            Some(&existing) => {
                let merged = &mut priced[existing];
                merged.quantity += line.quantity;
                merged.line_total = merged.unit_price * rust_decimal::Decimal::from(merged.quantity);
            }
            None => {
                index_by_type.insert(ticket.name.clone(), priced.len());
                priced.push(PricedTicketLine {
                    ticket_type: ticket.name.clone(),
                    quantity: line.quantity,
                    unit_price: ticket.price,
                    line_total: ticket.price * rust_decimal::Decimal::from(line.quantity),
                });
            }
        }
    }

    errors.into_result()?;
    Ok(TicketSelection { lines: priced })
}

/// Attendee slots must match the selected quantity exactly and each slot
/// must be complete.
pub fn validate_attendees(
    details: &AttendeeDetails,
    selection: &TicketSelection,
) -> Result<(), ServiceError> {
    let mut errors = FieldErrors::new();

    if blank(&details.organization) {
        errors.add("organization", "Organization is required");
    }

    let expected = selection.total_quantity();
    if details.attendees.len() != expected {
        errors.add(
            "attendees",
            format!(
                "Enter details for exactly {} attendee{}",
                expected,
                if expected == 1 { "" } else { "s" }
            ),
        );
    }

    for (i, attendee) in details.attendees.iter().enumerate() {
        if blank(&attendee.full_name) {
            errors.add(format!("attendees[{}].full_name", i), "Name is required");
        }
        if !validator::validate_email(attendee.email.trim()) {
            errors.add(
                format!("attendees[{}].email", i),
                "Enter a valid email address",
            );
        }
        if blank(&attendee.role) {
            errors.add(format!("attendees[{}].role", i), "Role is required");
        }
        if blank(&attendee.organization) {
            errors.add(
                format!("attendees[{}].organization", i),
                "Organization is required",
            );
        }
    }

    if !details.terms_accepted {
        errors.add("terms_accepted", "You must accept the terms to continue");
    }

    errors.into_result()
}

pub fn validate_payment(payment: &PaymentDetails) -> Result<(), ServiceError> {
    if payment.payment_method == PaymentMethod::BankTransfer
        && payment.invoice_reference.as_deref().map_or(true, blank)
    {
        return Err(ServiceError::validation(
            "invoice_reference",
            "Bank transfers need an invoice reference",
        ));
    }
    Ok(())
}
