/// Types with an identity element and an associative combine, used for
/// effect rows and free-variable sets.
pub trait Monoid: Sized {
    fn unit() -> Self;
    fn append(self, other: Self) -> Self;

    fn extend(self, others: impl IntoIterator<Item = Self>) -> Self {
        others.into_iter().fold(self, Self::append)
    }
    fn concat(others: impl IntoIterator<Item = Self>) -> Self {
        Self::unit().extend(others)
    }
}
