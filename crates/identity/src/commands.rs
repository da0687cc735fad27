//! Player-facing command API. Every entry point returns text (or a
//! transaction carrying its report) instead of surfacing raw errors.

use crate::errors::*;
use crate::service::IdentityService;
use masque_types::{ActorId, HandleId, HandleType, Party, Transaction, COIN};
use tracing::{debug, error};

impl IdentityService {
    /// `.handle [name]`, `.burner [name]` and the NPC variant.
    ///
    /// Without a name, reports the current handle. Otherwise switches to the
    /// named handle, creating it first when it is unused.
    pub async fn process_handle_command(
        &self,
        actor_id: &ActorId,
        requested: Option<&str>,
        as_burner: bool,
        as_npc: bool,
    ) -> String {
        let Some(raw) = requested else {
            let mut response = match self.current_handle_report(actor_id) {
                Ok(report) => report,
                Err(err) => return report_error(actor_id, &err),
            };
            if as_burner {
                response.push_str(" To create a new burner, use \".burner <new_name>\".");
            }
            return response;
        };

        let (handle_id, changed) = match HandleId::normalize(raw) {
            Ok(parsed) => parsed,
            Err(err) => return report_error(actor_id, &err.into()),
        };
        let handle_type = if as_npc {
            HandleType::Npc
        } else if as_burner {
            HandleType::Burner
        } else {
            HandleType::Regular
        };

        let mut response = match self.create_and_switch(actor_id, &handle_id, handle_type).await {
            Ok(outcome) => match (outcome.created, outcome.handle.handle_type) {
                (true, HandleType::Burner) => format!(
                    "Switched to new burner handle **{handle_id}** (created now). \
                     To destroy it, use \".burn {handle_id}\"."
                ),
                (true, HandleType::Npc) => {
                    format!("Switched to new NPC handle **{handle_id}** (created now).")
                }
                (true, _) => format!("Switched to new handle **{handle_id}** (created now)."),
                (false, HandleType::Burner) => format!(
                    "Switched to burner handle **{handle_id}**. \
                     Remember to burn it when done, using \".burn {handle_id}\"."
                ),
                (false, _) => format!("Switched to handle **{handle_id}**."),
            },
            Err(err) => report_error(actor_id, &err),
        };
        if changed {
            response.push_str(&format!(
                "\nNote that handles are lowercase only: {} -> **{handle_id}**.",
                raw.trim()
            ));
        }
        response
    }

    /// `.burn <name>`
    pub async fn process_burn_command(&self, actor_id: &ActorId, burner: Option<&str>) -> String {
        let Some(raw) = burner else {
            return "Error: No burner handle specified. Use \".burn <handle>\"".to_string();
        };
        let handle_id = match HandleId::normalize(raw) {
            Ok((handle_id, _)) => handle_id,
            Err(err) => return report_error(actor_id, &err.into()),
        };
        match self.burn(actor_id, &handle_id).await {
            Ok(outcome) => {
                let mut response = format!(
                    "Destroyed burner handle **{}**.\n\
                     The name is retired and can never be claimed again.\n",
                    outcome.burnt
                );
                if outcome.rescued > 0 {
                    response.push_str(&format!(
                        "Your current handle is **{}**; the remaining {COIN} {} from {} was transferred there.",
                        outcome.active, outcome.rescued, outcome.burnt
                    ));
                } else {
                    response.push_str(&format!("Your current handle is **{}**.", outcome.active));
                }
                response
            }
            Err(err) => report_error(actor_id, &err),
        }
    }

    /// `.collect`
    pub async fn process_collect_command(&self, actor_id: &ActorId) -> String {
        match self.collect_all(actor_id).await {
            Ok(outcome) => format!(
                "Collected {COIN} **{}** from your other handles into **{}**, \
                 which now holds {COIN} **{}**.",
                outcome.moved, outcome.active, outcome.total
            ),
            Err(err) => report_error(actor_id, &err),
        }
    }

    /// `.balance`
    pub fn get_all_handles_balance_report(&self, actor_id: &ActorId) -> String {
        match self.ledger.balance_report(actor_id) {
            Ok(report) => report,
            Err(masque_ledger::LedgerError::ActorNotFound { .. }) => {
                IdentityError::UnknownActor {
                    actor: actor_id.to_string(),
                }
                .user_message()
            }
            Err(err) => report_error(actor_id, &err.into()),
        }
    }

    /// Pay `amount` from the actor's active handle to `recipient`.
    ///
    /// The payer is read under the `paying_` lease, so a concurrent switch
    /// or burn is ordered entirely before or after the payment. With
    /// `silent_on_failure` no report is attached, which suits payments
    /// triggered by reactions rather than typed commands.
    pub async fn try_to_pay(
        &self,
        actor_id: &ActorId,
        recipient: Option<&str>,
        amount: u64,
        silent_on_failure: bool,
    ) -> Transaction {
        let recipient_id = recipient.and_then(|raw| HandleId::normalize(raw).ok().map(|(h, _)| h));
        let recipient_party = recipient_id.clone().map_or(Party::System, Party::Handle);

        let key = recipient_id
            .as_ref()
            .map(HandleId::as_str)
            .or(recipient)
            .unwrap_or_default();
        let _lease = match self.lease(format!("paying_{key}")).await {
            Ok(lease) => lease,
            Err(err) => {
                let message = report_error(actor_id, &err);
                return report_unless(
                    Transaction::new(Party::System, recipient_party, amount),
                    silent_on_failure,
                    message,
                );
            }
        };

        let payer = match self.handles.active_handle(actor_id) {
            Ok(Some(handle)) => handle.handle_id,
            Ok(None) => {
                let err = IdentityError::UnknownActor {
                    actor: actor_id.to_string(),
                };
                return report_unless(
                    Transaction::new(Party::System, recipient_party, amount),
                    silent_on_failure,
                    err.user_message(),
                );
            }
            Err(err) => {
                let message = report_error(actor_id, &err.into());
                return report_unless(
                    Transaction::new(Party::System, recipient_party, amount),
                    silent_on_failure,
                    message,
                );
            }
        };
        let pending = Transaction::new(payer.clone(), recipient_party, amount);

        let recipient_id = match (recipient, recipient_id) {
            (None, _) => {
                return report_unless(
                    pending,
                    silent_on_failure,
                    "Error: no recipient given. Use \".pay <handle> <amount>\".".to_string(),
                )
            }
            (Some(raw), None) => {
                return report_unless(
                    pending,
                    silent_on_failure,
                    format!(
                        "Failed to transfer {COIN} **{amount}** from {payer} to {raw}; \
                         recipient does not exist. Check the spelling."
                    ),
                )
            }
            (Some(_), Some(recipient_id)) => recipient_id,
        };
        if recipient_id == payer {
            return report_unless(
                pending,
                silent_on_failure,
                format!("Error: cannot transfer funds from account {payer} to itself."),
            );
        }
        if amount == 0 {
            return report_unless(
                pending,
                silent_on_failure,
                "Error: the amount to transfer must be a positive number.".to_string(),
            );
        }

        let recipient_handle = match self.handles.get(&recipient_id) {
            Ok(handle) => handle,
            Err(err) => {
                let message = report_error(actor_id, &err.into());
                return report_unless(pending, silent_on_failure, message);
            }
        };
        if !recipient_handle.exists() || recipient_handle.handle_type == HandleType::Burnt {
            return report_unless(
                pending,
                silent_on_failure,
                format!(
                    "Failed to transfer {COIN} **{amount}** from {payer} to {recipient_id}; \
                     recipient does not exist. Check the spelling."
                ),
            );
        }

        let tx = match self
            .ledger
            .transfer_and_record(&payer, &recipient_id, amount)
            .await
        {
            Ok(tx) => tx,
            Err(err) => {
                let message = report_error(actor_id, &err.into());
                return report_unless(pending, silent_on_failure, message);
            }
        };
        if !tx.success {
            let balance = self.ledger.balance(&payer).unwrap_or(0);
            let err = IdentityError::InsufficientFunds {
                handle: payer.to_string(),
                balance,
                amount,
            };
            debug!(actor = %actor_id, "{}", err);
            let message = format!(
                "Failed to transfer {COIN} **{amount}** from {payer} to {recipient_id}; \
                 current balance is {COIN} **{balance}**."
            );
            return report_unless(tx, silent_on_failure, message);
        }

        let mut message = format!(
            "Successfully transferred {COIN} **{amount}** from {payer} to **{recipient_id}**."
        );
        if recipient_handle.is_owned_by(actor_id) {
            message.push_str(" (Note: you control both accounts.)");
        }
        report_unless(tx, silent_on_failure, message)
    }

    /// Admin: drop every actor, handle and ledger entry.
    pub async fn clear_all_handles(&self) -> Result<()> {
        self.clear_all().await
    }

    /// Admin: remove a single handle without rescuing its funds.
    pub async fn remove_handle(&self, handle: &str) -> Result<()> {
        let (handle_id, _) = HandleId::normalize(handle)?;
        self.purge(&handle_id).await
    }

    fn current_handle_report(&self, actor_id: &ActorId) -> Result<String> {
        let handle = self
            .handles
            .active_handle(actor_id)?
            .ok_or_else(|| IdentityError::UnknownActor {
                actor: actor_id.to_string(),
            })?;
        let id = &handle.handle_id;
        Ok(if handle.handle_type == HandleType::Burner {
            format!(
                "Your current handle is **{id}**. It's a burner handle; to destroy it, use \
                 \".burn {id}\". To switch handle, type \".handle <new_name>\"."
            )
        } else {
            format!("Your current handle is **{id}**. To switch handle, type \".handle <new_name>\".")
        })
    }
}

/// Log an error at the level its kind calls for and render it for the player.
fn report_error(actor_id: &ActorId, err: &IdentityError) -> String {
    match err.kind() {
        ErrorKind::Integrity | ErrorKind::Internal => {
            error!(integrity = true, actor = %actor_id, "Identity command failed: {}", err)
        }
        _ => debug!(actor = %actor_id, "Identity command rejected: {}", err),
    }
    err.user_message()
}

fn report_unless(tx: Transaction, silent: bool, report: String) -> Transaction {
    if silent {
        tx
    } else {
        tx.with_report(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use masque_ledger::MemoryAuditSink;
    use masque_storage::MemoryStorage;
    use std::sync::Arc;

    async fn service() -> IdentityService {
        let service = IdentityService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryAuditSink::new()),
            IdentityConfig::default(),
        );
        service
            .register_actor(&ActorId::new("p1"), &HandleId::parse("alice").unwrap())
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_handle_command_reports() {
        let service = service().await;
        let p1 = ActorId::new("p1");

        assert_eq!(
            service.process_handle_command(&p1, None, false, false).await,
            "Your current handle is **alice**. To switch handle, type \".handle <new_name>\"."
        );
        assert_eq!(
            service.process_handle_command(&p1, Some("Night_Owl"), true, false).await,
            "Switched to new burner handle **night_owl** (created now). \
             To destroy it, use \".burn night_owl\".\
             \nNote that handles are lowercase only: Night_Owl -> **night_owl**."
        );
        assert!(service
            .process_handle_command(&p1, None, true, false)
            .await
            .ends_with("To create a new burner, use \".burner <new_name>\"."));
        assert_eq!(
            service.process_handle_command(&p1, Some("alice"), false, false).await,
            "Switched to handle **alice**."
        );
        assert!(service
            .process_handle_command(&p1, Some("alice"), true, false)
            .await
            .contains("is not a burner handle"));
        assert!(service
            .process_handle_command(&p1, Some("bad__name"), false, false)
            .await
            .starts_with("Error: cannot create handle bad__name."));
    }

    #[tokio::test]
    async fn test_handle_command_for_foreign_handle() {
        let service = service().await;
        let p2 = ActorId::new("p2");
        service
            .register_actor(&p2, &HandleId::parse("bob").unwrap())
            .await
            .unwrap();
        assert_eq!(
            service.process_handle_command(&p2, Some("alice"), false, false).await,
            "Error: the handle alice is currently registered by someone else."
        );
    }

    #[tokio::test]
    async fn test_burn_command_reports() {
        let service = service().await;
        let p1 = ActorId::new("p1");
        assert_eq!(
            service.process_burn_command(&p1, None).await,
            "Error: No burner handle specified. Use \".burn <handle>\""
        );
        service.process_handle_command(&p1, Some("mask"), true, false).await;
        service
            .add_funds(&HandleId::parse("mask").unwrap(), 12)
            .await
            .unwrap();
        let response = service.process_burn_command(&p1, Some("MASK")).await;
        assert!(response.starts_with("Destroyed burner handle **mask**."));
        assert!(response.ends_with(
            "Your current handle is **alice**; the remaining ¥ 12 from mask was transferred there."
        ));
        assert_eq!(
            service.process_burn_command(&p1, Some("alice")).await,
            "Error: **alice** is not a burner handle, cannot be destroyed. \
             To stop using it, simply switch to another handle."
        );
    }

    #[tokio::test]
    async fn test_pay_rejections_carry_reports() {
        let service = service().await;
        let p1 = ActorId::new("p1");
        service
            .add_funds(&HandleId::parse("alice").unwrap(), 10)
            .await
            .unwrap();

        let tx = service.try_to_pay(&p1, Some("alice"), 5, false).await;
        assert!(!tx.success);
        assert_eq!(
            tx.report.as_deref(),
            Some("Error: cannot transfer funds from account alice to itself.")
        );

        let tx = service.try_to_pay(&p1, Some("nobody"), 5, false).await;
        assert!(tx.report.unwrap().contains("recipient does not exist"));

        let tx = service.try_to_pay(&p1, Some("nobody"), 5, true).await;
        assert!(!tx.success);
        assert!(tx.report.is_none());

        let tx = service.try_to_pay(&p1, None, 5, false).await;
        assert!(!tx.success);
        assert!(tx.report.is_some());

        let tx = service.try_to_pay(&ActorId::new("ghost"), Some("alice"), 5, false).await;
        assert!(!tx.success);
        assert_eq!(tx.payer, Party::System);
    }

    #[tokio::test]
    async fn test_pay_uses_active_handle_at_lease_time() {
        let service = Arc::new(service().await);
        let p1 = ActorId::new("p1");
        let p2 = ActorId::new("p2");
        service
            .register_actor(&p2, &HandleId::parse("bob").unwrap())
            .await
            .unwrap();
        service.process_handle_command(&p1, Some("mask"), true, false).await;
        for handle in ["alice", "mask"] {
            service
                .add_funds(&HandleId::parse(handle).unwrap(), 50)
                .await
                .unwrap();
        }

        let held = service.coordinator.lock("held_elsewhere").await.unwrap();
        let payment = {
            let service = service.clone();
            let p1 = p1.clone();
            tokio::spawn(async move { service.try_to_pay(&p1, Some("bob"), 30, false).await })
        };
        // Let the payment start and queue behind the held lease.
        tokio::task::yield_now().await;
        drop(held);
        service
            .switch(&p1, &HandleId::parse("alice").unwrap(), HandleType::Regular)
            .await
            .unwrap();

        let tx = payment.await.unwrap();
        assert!(tx.success);
        assert_eq!(tx.payer, Party::Handle(HandleId::parse("alice").unwrap()));
        assert_eq!(service.balance(&HandleId::parse("alice").unwrap()).unwrap(), 20);
        assert_eq!(service.balance(&HandleId::parse("mask").unwrap()).unwrap(), 50);
    }

    #[tokio::test]
    async fn test_pay_between_own_handles_notes_control() {
        let service = service().await;
        let p1 = ActorId::new("p1");
        service.process_handle_command(&p1, Some("second"), false, false).await;
        service
            .add_funds(&HandleId::parse("second").unwrap(), 40)
            .await
            .unwrap();

        let tx = service.try_to_pay(&p1, Some("alice"), 15, false).await;
        assert!(tx.success);
        assert_eq!(
            tx.report.as_deref(),
            Some("Successfully transferred ¥ **15** from second to **alice**. (Note: you control both accounts.)")
        );
        assert_eq!(
            service.get_all_handles_balance_report(&p1),
            "Current balance for all your accounts:\n\
             > alice: ¥ **15**\n\
             > **second**: ¥ **25**\n\
             Total: ¥ **40**"
        );
    }

    #[tokio::test]
    async fn test_collect_command() {
        let service = service().await;
        let p1 = ActorId::new("p1");
        service.process_handle_command(&p1, Some("spare"), false, false).await;
        service
            .add_funds(&HandleId::parse("alice").unwrap(), 30)
            .await
            .unwrap();
        assert_eq!(
            service.process_collect_command(&p1).await,
            "Collected ¥ **30** from your other handles into **spare**, which now holds ¥ **30**."
        );
    }

    #[tokio::test]
    async fn test_remove_handle_normalizes_input() {
        let service = service().await;
        let p1 = ActorId::new("p1");
        service.process_handle_command(&p1, Some("spare"), false, false).await;
        service.remove_handle(" Spare ").await.unwrap();
        assert!(matches!(
            service.remove_handle("spare").await,
            Err(IdentityError::UnknownHandle { .. })
        ));
        service.clear_all_handles().await.unwrap();
        assert!(service.actors().unwrap().is_empty());
    }
}
