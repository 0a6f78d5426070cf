mod test_conn_state;
mod test_dns_list;
mod test_framing;
