//! Invites and collaborator grants.

use loom_core::{ConversationId, Permission, UserId};
use tracing::{info, instrument};

use super::{ConversationStore, access_of};
use crate::access::Capability;
use crate::errors::{Result, StoreError};
use crate::sqlite::repositories::collaborator::CollaboratorRepo;
use crate::sqlite::repositories::conversation::ConversationRepo;
use crate::sqlite::repositories::invite::InviteRepo;
use crate::sqlite::row_types::{CollaboratorRow, InviteRow};

impl ConversationStore {
    /// Issue a single-use invite token. Owner only; `None` if the
    /// conversation does not exist.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, %permission))]
    pub fn create_invite(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        permission: Permission,
    ) -> Result<Option<InviteRow>> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(None);
        }
        let invite = self.retry_on_sqlite_busy(|| InviteRepo::create(&conn, conversation_id, permission, user))?;
        info!("invite created");
        Ok(Some(invite))
    }

    /// Redeem an invite token, granting `user` its permission.
    ///
    /// Fails with [`StoreError::InviteNotFound`] for an unknown token,
    /// [`StoreError::AlreadyHaveAccess`] if `user` owns or already
    /// collaborates on the conversation, and
    /// [`StoreError::InviteAlreadyClaimed`] if someone used it first.
    #[instrument(skip_all, fields(user_id = %user))]
    pub fn claim_invite(&self, token: &str, user: &UserId) -> Result<CollaboratorRow> {
        let conn = self.conn()?;
        let granted = self.retry_on_sqlite_busy(|| {
            let tx = conn.unchecked_transaction()?;
            let invite = InviteRepo::get(&tx, token)?.ok_or(StoreError::InviteNotFound)?;
            let row = ConversationRepo::get_by_id(&tx, &invite.conversation_id)?
                .ok_or_else(|| StoreError::ConversationNotFound(invite.conversation_id.clone()))?;
            if access_of(&tx, &row, user)?.is_some() {
                return Err(StoreError::AlreadyHaveAccess);
            }
            if invite.is_claimed() || !InviteRepo::mark_claimed(&tx, token, user)? {
                return Err(StoreError::InviteAlreadyClaimed);
            }
            let granted = CollaboratorRepo::grant(
                &tx,
                &invite.conversation_id,
                user,
                invite.permission_level(),
                Some(token),
            )?;
            tx.commit()?;
            Ok(granted)
        })?;
        info!(
            conversation_id = %granted.conversation_id,
            permission = %granted.permission,
            "invite claimed"
        );
        Ok(granted)
    }

    /// Remove `target`'s grant.
    ///
    /// Owners may remove anyone; a collaborator may remove only themselves.
    /// `false` if there was no grant or no conversation.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, target = %target))]
    pub fn revoke_collaborator(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        target: &UserId,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let capability = if user == target {
            Capability::Read
        } else {
            Capability::Own
        };
        if self.authorize(&conn, conversation_id, user, capability)?.is_none() {
            return Ok(false);
        }
        let revoked = self.retry_on_sqlite_busy(|| CollaboratorRepo::revoke(&conn, conversation_id, target))?;
        if revoked {
            info!("collaborator revoked");
        }
        Ok(revoked)
    }

    /// Everyone the conversation is shared with. Any reader may list.
    pub fn list_collaborators(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Vec<CollaboratorRow>> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Read)?.is_none() {
            return Ok(Vec::new());
        }
        CollaboratorRepo::list(&conn, conversation_id)
    }

    /// Every invite issued for the conversation. Owner only.
    pub fn list_invites(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Vec<InviteRow>> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(Vec::new());
        }
        InviteRepo::list(&conn, conversation_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::access::Access;
    use crate::store::NewConversation;
    use assert_matches::assert_matches;

    fn setup() -> (ConversationStore, ConversationId, UserId) {
        let store = ConversationStore::in_memory().unwrap();
        let owner = UserId::from("user_owner");
        let row = store.create_conversation(&owner, NewConversation::default()).unwrap();
        (store, ConversationId::from(row.id.as_str()), owner)
    }

    #[test]
    fn claim_grants_invite_permission() {
        let (store, conv, owner) = setup();
        let invite = store.create_invite(&conv, &owner, Permission::Editor).unwrap().unwrap();
        let guest = UserId::from("user_guest");
        let granted = store.claim_invite(&invite.token, &guest).unwrap();
        assert_eq!(granted.permission_level(), Permission::Editor);
        assert_eq!(granted.invite_token.as_deref(), Some(invite.token.as_str()));
        assert_eq!(
            store.access_for(&conv, &guest).unwrap(),
            Some(Access::Granted(Permission::Editor))
        );
        assert!(store.list_invites(&conv, &owner).unwrap()[0].is_claimed());
    }

    #[test]
    fn claim_errors_are_distinguishable() {
        let (store, conv, owner) = setup();
        let guest = UserId::from("user_guest");
        assert_matches!(store.claim_invite("inv_nope", &guest), Err(StoreError::InviteNotFound));

        let invite = store.create_invite(&conv, &owner, Permission::Viewer).unwrap().unwrap();
        assert_matches!(store.claim_invite(&invite.token, &owner), Err(StoreError::AlreadyHaveAccess));

        store.claim_invite(&invite.token, &guest).unwrap();
        assert_matches!(store.claim_invite(&invite.token, &guest), Err(StoreError::AlreadyHaveAccess));
        let other = UserId::from("user_other");
        assert_matches!(store.claim_invite(&invite.token, &other), Err(StoreError::InviteAlreadyClaimed));
        assert_eq!(store.access_for(&conv, &other).unwrap(), None);
    }

    #[test]
    fn only_owner_issues_invites() {
        let (store, conv, owner) = setup();
        let invite = store.create_invite(&conv, &owner, Permission::Editor).unwrap().unwrap();
        let editor = UserId::from("user_editor");
        store.claim_invite(&invite.token, &editor).unwrap();
        assert_matches!(
            store.create_invite(&conv, &editor, Permission::Viewer),
            Err(StoreError::AccessDenied)
        );
        assert!(store
            .create_invite(&ConversationId::from("conv_missing"), &owner, Permission::Viewer)
            .unwrap()
            .is_none());
    }

    #[test]
    fn revoke_by_owner_or_self() {
        let (store, conv, owner) = setup();
        let a = UserId::from("user_a");
        let b = UserId::from("user_b");
        for user in [&a, &b] {
            let invite = store.create_invite(&conv, &owner, Permission::Collaborator).unwrap().unwrap();
            store.claim_invite(&invite.token, user).unwrap();
        }
        assert_eq!(store.list_collaborators(&conv, &a).unwrap().len(), 2);

        assert_matches!(store.revoke_collaborator(&conv, &a, &b), Err(StoreError::AccessDenied));
        assert!(store.revoke_collaborator(&conv, &a, &a).unwrap());
        assert!(store.revoke_collaborator(&conv, &owner, &b).unwrap());
        assert!(!store.revoke_collaborator(&conv, &owner, &b).unwrap());
        assert!(store.list_collaborators(&conv, &owner).unwrap().is_empty());
    }
}
