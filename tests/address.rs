#[cfg(test)]
mod tests {
    use bt_av::Address;

    #[test]
    fn from_string_invalid() {
        assert!(Address::from_string(String::from("")).is_none());
        assert!(Address::from_string(String::from("some invalid string")).is_none());
        assert!(Address::from_string(String::from("aa:bb:cc:dd:ee:ff:00")).is_none());
        assert!(Address::from_string(String::from("aa:bb:cc:dd:ee")).is_none());
        assert!(Address::from_string(String::from("aa:bb:cc:dd::ff")).is_none());
    }

    #[test]
    fn from_string_valid() {
        let addr = Address::from_string(String::from("11:22:33:aa:bb:cc"));
        assert!(addr.is_some());
        assert_eq!(vec![0x11, 0x22, 0x33, 0xaa, 0xbb, 0xcc], addr.unwrap().to_byte_vec());

        // Upper/lower case should not matter.
        let addr = Address::from_string(String::from("11:22:33:AA:BB:CC"));
        assert!(addr.is_some());
        assert_eq!(vec![0x11, 0x22, 0x33, 0xaa, 0xbb, 0xcc], addr.unwrap().to_byte_vec());
    }

    #[test]
    fn from_byte_vec_invalid() {
        assert!(Address::from_byte_vec(&vec![]).is_none());
        assert!(Address::from_byte_vec(&vec![1, 2, 3, 4, 5]).is_none());
        assert!(Address::from_byte_vec(&vec![1, 2, 3, 4, 5, 6, 7]).is_none());
    }

    #[test]
    fn from_byte_vec_valid() {
        let addr = Address::from_byte_vec(&vec![1, 2, 3, 4, 5, 6]);
        assert!(addr.is_some());
        assert_eq!(vec![1, 2, 3, 4, 5, 6], addr.unwrap().to_byte_vec());
    }

    #[test]
    fn display_round_trip() {
        let addr = Address::from_string(String::from("AA:BB:CC:DD:EE:01")).unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
        assert_eq!(Address::from_string(addr.to_string()), Some(addr));
    }
}
