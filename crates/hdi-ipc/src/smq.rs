//! Parcel form of [`QueueMeta`], so a queue creator can hand a peer what it
//! needs to attach.
//!
//! Layout: `[string name][u32 capacity][u32 element_size][u64 segment_len]`.

use hdi_smq::QueueMeta;

use crate::parcel::{Decode, Encode, Parcel, ParcelError, ParcelReader};

impl Encode for QueueMeta {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_string(&self.name);
        parcel.write_u32(self.capacity);
        parcel.write_u32(self.element_size);
        parcel.write_u64(self.segment_len);
    }
}

impl Decode for QueueMeta {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        Ok(QueueMeta {
            name: reader.read_string()?,
            capacity: reader.read_u32()?,
            element_size: reader.read_u32()?,
            segment_len: reader.read_u64()?,
        })
    }
}
