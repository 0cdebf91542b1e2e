//! GSM emergency dispatch through the microcontroller's modem.
//!
//! One cycle: place calls to every eligible contact in order (up to five
//! attempts each), then fan an SMS out to the eligible sms-mode contacts.
//! Eligibility is `general` plus the cycle's hazard category. The serial
//! vocabulary carries no call-progress event, so a successfully written
//! call command is followed by a bounded wait instead of modem parsing;
//! delivery is best-effort by design.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::defaults::{GSM_CALL_WAIT_SECS, GSM_MAX_RETRIES, GSM_RETRY_DELAY_SECS};
use crate::serial::{CommandFrame, CommandSink};
use crate::state::StateStore;
use crate::types::{GsmContact, GsmMode, HazardCategory};

fn eligible(contact: &GsmContact, mode: GsmMode, category: HazardCategory) -> bool {
    contact.mode == mode
        && (contact.category == HazardCategory::General || contact.category == category)
}

/// Run one full emergency cycle: calls, then SMS.
pub async fn run_emergency_sequence(
    store: Arc<StateStore>,
    sink: Arc<dyn CommandSink>,
    reason: String,
    category: HazardCategory,
    cancel: CancellationToken,
) {
    let contacts = store.gsm_contacts();
    let call_list: Vec<GsmContact> = contacts
        .iter()
        .filter(|c| eligible(c, GsmMode::Call, category))
        .cloned()
        .collect();

    if call_list.is_empty() {
        warn!(category = %category, "No call contacts for emergency dispatch");
    }

    for contact in &call_list {
        let mut reached = false;
        for attempt in 1..=GSM_MAX_RETRIES {
            if cancel.is_cancelled() {
                return;
            }
            info!(
                number = %contact.number,
                attempt,
                max = GSM_MAX_RETRIES,
                "Placing emergency call"
            );
            let sent = sink.send(CommandFrame::GsmCall {
                number: contact.number.clone(),
                robot_talk: true,
                msg: reason.clone(),
            });
            if sent {
                // Let the call play out before dialing the next contact.
                if wait_or_cancel(&cancel, Duration::from_secs(GSM_CALL_WAIT_SECS)).await {
                    return;
                }
                reached = true;
                break;
            }
            if wait_or_cancel(&cancel, Duration::from_secs(GSM_RETRY_DELAY_SECS)).await {
                return;
            }
        }
        if !reached {
            error!(
                number = %contact.number,
                attempts = GSM_MAX_RETRIES,
                "Failed to reach contact"
            );
        }
    }

    send_sms(&store, sink.as_ref(), &format!("SOS: {reason}"), category);
}

/// Fan one SMS out to every eligible sms-mode contact. A contact's custom
/// message wins over the cycle text.
pub fn send_sms(
    store: &StateStore,
    sink: &dyn CommandSink,
    message: &str,
    category: HazardCategory,
) {
    for contact in store
        .gsm_contacts()
        .iter()
        .filter(|c| eligible(c, GsmMode::Sms, category))
    {
        let text = if contact.message.is_empty() {
            message.to_string()
        } else {
            contact.message.clone()
        };
        let sent = sink.send(CommandFrame::GsmSms {
            number: contact.number.clone(),
            message: text.clone(),
        });
        if sent {
            info!(number = %contact.number, "SMS dispatched");
        } else {
            warn!(number = %contact.number, "SMS send failed");
        }
    }
}

async fn wait_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
