/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use zbus::fdo;

pub(crate) fn to_zbus_fdo_error<S: ToString>(error: S) -> fdo::Error {
    fdo::Error::Failed(error.to_string())
}

pub(crate) fn zbus_to_zbus_fdo(error: zbus::Error) -> fdo::Error {
    match error {
        zbus::Error::FDO(error) => *error,
        error => fdo::Error::Failed(error.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_to_zbus_fdo_error() {
        let error = to_zbus_fdo_error(anyhow!("driver refused"));
        assert!(matches!(error, fdo::Error::Failed(message) if message == "driver refused"));
    }

    #[test]
    fn test_zbus_to_zbus_fdo_unwraps() {
        let error = zbus::Error::FDO(Box::new(fdo::Error::InvalidArgs(String::from(
            "no such profile",
        ))));
        assert!(matches!(
            zbus_to_zbus_fdo(error),
            fdo::Error::InvalidArgs(message) if message == "no such profile"
        ));
    }
}
