/// RFC 7617 token: base64 of `user:password`.
pub(crate) fn token(user: &str, password: &str) -> String {
    base64::encode(format!("{}:{}", user, password))
}

#[cfg(test)]
mod tests {
    #[test]
    fn rfc7617_example() {
        // The canonical Aladdin example.
        assert_eq!(
            super::token("Aladdin", "open sesame"),
            "QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
