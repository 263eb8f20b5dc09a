mod circuit_breaker;
