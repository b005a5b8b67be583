/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

thread_local! {
    static TEST: RefCell<Option<Rc<Test>>> = const { RefCell::new(None) };
}

pub(crate) struct Test {
    base: TempDir,
}

pub(crate) struct TestHandle {
    pub test: Rc<Test>,
}

impl Test {
    pub fn path(&self) -> &Path {
        self.base.path()
    }
}

/// Install a scratch filesystem root for the current test. Every path the
/// crate resolves through `crate::path()` lands under this root until the
/// returned handle is dropped.
pub(crate) fn start() -> TestHandle {
    let test = Rc::new(Test {
        base: TempDir::new().expect("tempdir"),
    });
    TEST.with(|lock| {
        *lock.borrow_mut() = Some(test.clone());
    });
    TestHandle { test }
}

pub(crate) fn current() -> Rc<Test> {
    TEST.with(|lock| lock.borrow().clone().expect("testing not started"))
}

impl Drop for TestHandle {
    fn drop(&mut self) {
        TEST.with(|lock| {
            lock.borrow_mut().take();
        });
    }
}

/// Assert that an enum round-trips through its wire names.
#[macro_export]
macro_rules! enum_roundtrip {
    ($enum:ident { $($nick:literal: str = $variant:ident,)+ }) => {
        $(
            assert_eq!($enum::$variant.to_string(), $nick);
            assert_eq!($enum::from_str($nick).unwrap(), $enum::$variant);
        )+
    };
}
