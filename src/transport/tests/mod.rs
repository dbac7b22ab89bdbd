mod test_codec;
mod test_connection;
