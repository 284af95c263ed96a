// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Composable validators for descriptor values.
//!
//! Validators run after text parsing and before assignment, so a value
//! which reaches a typed field has always passed its descriptor's
//! validator. The building blocks here can be combined with
//! [`All`] to express compound constraints.

use crate::error::Error;

/// A constraint on parsed values of type `T`.
pub trait Validator<T: ?Sized> {
    /// Check the value, returning a validation error if it is not
    /// acceptable.
    fn validate(&self, value: &T) -> Result<(), Error>;
}

/// Require a value to be within an inclusive range.
pub struct Range<T> {
    /// Lower bound, inclusive. `None` means unbounded.
    pub min: Option<T>,

    /// Upper bound, inclusive. `None` means unbounded.
    pub max: Option<T>,
}

impl<T: PartialOrd> Validator<T> for Range<T> {
    fn validate(&self, value: &T) -> Result<(), Error> {
        if let Some(ref min) = self.min {
            if value < min {
                return Err(Error::Validation("value below permitted minimum"));
            }
        }
        if let Some(ref max) = self.max {
            if value > max {
                return Err(Error::Validation("value above permitted maximum"));
            }
        }
        Ok(())
    }
}

/// Require a string to match a regular expression.
pub struct Pattern(regex::Regex);

impl Pattern {
    /// Compile the given pattern.
    ///
    /// The pattern is anchored implicitly; partial matches do not count.
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let anchored = format!("\\A(?:{})\\z", pattern);
        regex::Regex::new(&anchored)
            .map(Pattern)
            .map_err(|_| Error::Validation("invalid pattern"))
    }
}

impl Validator<str> for Pattern {
    fn validate(&self, value: &str) -> Result<(), Error> {
        if self.0.is_match(value) {
            Ok(())
        } else {
            Err(Error::Validation("value does not match required pattern"))
        }
    }
}

/// Require a value to be one of an enumerated set.
pub struct Choice<T>(pub Vec<T>);

impl<T: PartialEq> Validator<T> for Choice<T> {
    fn validate(&self, value: &T) -> Result<(), Error> {
        if self.0.iter().any(|option| option == value) {
            Ok(())
        } else {
            Err(Error::Validation("value not in permitted set"))
        }
    }
}

/// Require a string to be non-empty.
pub struct NonEmpty;

impl Validator<str> for NonEmpty {
    fn validate(&self, value: &str) -> Result<(), Error> {
        if value.is_empty() {
            Err(Error::Validation("value must not be empty"))
        } else {
            Ok(())
        }
    }
}

/// Conjunction of validators: all of them must accept the value.
pub struct All<'x, T: ?Sized>(pub Vec<&'x dyn Validator<T>>);

impl<T: ?Sized> Validator<T> for All<'_, T> {
    fn validate(&self, value: &T) -> Result<(), Error> {
        for validator in &self.0 {
            validator.validate(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range() {
        let v = Range {
            min: Some(1i8),
            max: Some(10),
        };
        assert!(v.validate(&1).is_ok());
        assert!(v.validate(&10).is_ok());
        assert!(v.validate(&0).is_err());
        assert!(v.validate(&11).is_err());
    }

    #[test]
    fn half_open_range() {
        let v = Range {
            min: None,
            max: Some(0i32),
        };
        assert!(v.validate(&i32::MIN).is_ok());
        assert!(v.validate(&1).is_err());
    }

    #[test]
    fn pattern_is_anchored() {
        let v = Pattern::new("[a-z]+").unwrap();
        assert!(v.validate("abc").is_ok());
        assert!(v.validate("abc1").is_err());
        assert!(v.validate("").is_err());
    }

    #[test]
    fn choice() {
        let v = Choice(vec!["chat".to_owned(), "groupchat".to_owned()]);
        assert!(v.validate(&"chat".to_owned()).is_ok());
        assert!(v.validate(&"headline".to_owned()).is_err());
    }

    #[test]
    fn composition() {
        let nonempty = NonEmpty;
        let pattern = Pattern::new("[0-9]*").unwrap();
        let both = All(vec![&nonempty as &dyn Validator<str>, &pattern]);
        assert!(both.validate("123").is_ok());
        assert!(both.validate("").is_err());
        assert!(both.validate("x").is_err());
    }
}
