use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// The runtime's only view of element serialization: size the state,
/// pack it into a byte buffer, unpack it back into an element.
pub trait Accessor: 'static {
    type Element;

    fn compute_size(elem: &Self::Element) -> usize;
    fn pack(elem: &Self::Element, buffer: &mut Vec<u8>);
    fn unpack(elem: &mut Self::Element, buffer: &[u8]);
}

/// Accessor for any serde-serializable element type.
pub struct SerdeAccessor<T>(PhantomData<T>);

impl<T: Serialize + DeserializeOwned + 'static> Accessor for SerdeAccessor<T> {
    type Element = T;

    fn compute_size(elem: &T) -> usize {
        bincode::serialized_size(elem).unwrap() as usize
    }

    fn pack(elem: &T, buffer: &mut Vec<u8>) {
        bincode::serialize_into(&mut *buffer, elem).unwrap();
    }

    fn unpack(elem: &mut T, buffer: &[u8]) {
        *elem = bincode::deserialize(buffer).unwrap();
    }
}

/// Size and pack an element into a fresh buffer.
pub(crate) fn pack_element<A: Accessor>(elem: &A::Element) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(A::compute_size(elem));
    A::pack(elem, &mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde::Serialize;

    use super::pack_element;
    use super::Accessor;
    use super::SerdeAccessor;

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
    struct Payload {
        values: Vec<f64>,
        name: String,
    }

    #[test]
    fn serde_accessor_round_trip() {
        let elem = Payload {
            values: vec![1.5, 2.5],
            name: "midplane".into(),
        };
        let buffer = pack_element::<SerdeAccessor<Payload>>(&elem);
        assert_eq!(buffer.len(), SerdeAccessor::<Payload>::compute_size(&elem));
        let mut restored = Payload::default();
        SerdeAccessor::unpack(&mut restored, &buffer);
        assert_eq!(restored, elem);
    }
}
