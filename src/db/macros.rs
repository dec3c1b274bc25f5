//! Convenience macros.

/// Build [`Params`](crate::models::Params) from a list of values.
///
/// Each value goes through `SqlValue::from`, so anything with a `From` impl
/// (integers, floats, strings, byte vectors, chrono types, `Option`s of those)
/// can be listed directly.
///
/// # Example
///
/// ```
/// use async_sql_bridge::params;
///
/// let params = params![42, "name", None::<i64>];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::models::Params::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::models::Params::from(vec![$($crate::models::SqlValue::from($value)),+])
    };
}

#[cfg(test)]
mod tests {
    use crate::models::SqlValue;

    #[test]
    fn test_params_macro() {
        assert!(params![].is_empty());
        let params = params![1, 2.5, "x", true, None::<String>,];
        assert_eq!(
            params.as_slice(),
            &[
                SqlValue::Int(1),
                SqlValue::Float(2.5),
                SqlValue::Text("x".to_string()),
                SqlValue::Bool(true),
                SqlValue::Null,
            ]
        );
    }
}
