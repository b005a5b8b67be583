/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;
use zbus::message::Header;
use zbus::{fdo, Connection};
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

use crate::error::to_zbus_fdo_error;

// Namespaced under the current bus name, not the legacy one.
pub(crate) const ACTION_SWITCH_PROFILE: &str = "org.freedesktop.UPower.PowerProfiles.switch-profile";
pub(crate) const ACTION_HOLD_PROFILE: &str = "org.freedesktop.UPower.PowerProfiles.hold-profile";

/// Gates the profile-switching surface behind polkit. The sender of each
/// incoming call is resolved to a polkit subject and checked against the
/// named action; decisions are not cached.
pub(crate) struct PolicyGate {
    authority: AuthorityProxy<'static>,
}

impl PolicyGate {
    pub async fn new(connection: &Connection) -> Result<PolicyGate> {
        let authority = AuthorityProxy::new(connection).await?;
        Ok(PolicyGate { authority })
    }

    pub async fn check(&self, header: &Header<'_>, action: &str) -> fdo::Result<()> {
        let subject = Subject::new_for_message_header(header).map_err(to_zbus_fdo_error)?;
        let result = self
            .authority
            .check_authorization(
                &subject,
                action,
                &HashMap::new(),
                CheckAuthorizationFlags::AllowUserInteraction.into(),
                "",
            )
            .await
            .map_err(to_zbus_fdo_error)?;
        if result.is_authorized {
            Ok(())
        } else {
            debug!("Authorization denied for {action}");
            Err(fdo::Error::AccessDenied(format!(
                "Not authorized for action {action}"
            )))
        }
    }
}
